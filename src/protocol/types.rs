use std::fmt;
use std::str::FromStr;

use crate::errors::GitError;
use crate::hash::ObjectHash;

/// Agent string announced in every advertisement.
pub const AGENT: &str = concat!("git-transport/", env!("CARGO_PKG_VERSION"));

/// Protocol error types
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Repository not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Protocol decode error: {0}")]
    Decode(String),

    #[error("Backend error: {message}")]
    Backend {
        message: String,
        /// Exit code of the git process, when the failure came from one.
        exit_code: Option<i32>,
    },

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("unsupported request: {0}")]
    UnsupportedRequest(String),

    #[error("Unsupported service: {0}")]
    UnsupportedService(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub fn not_found(address: &str) -> Self {
        ProtocolError::NotFound(address.to_string())
    }

    pub fn forbidden(msg: &str) -> Self {
        ProtocolError::Forbidden(msg.to_string())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        ProtocolError::Decode(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        ProtocolError::Backend {
            message: msg.into(),
            exit_code: None,
        }
    }

    pub fn invalid_service(service: &str) -> Self {
        ProtocolError::UnsupportedService(service.to_string())
    }

    /// Status to report on an SSH channel for this failure.
    pub fn exit_status(&self) -> u32 {
        match self {
            ProtocolError::Backend {
                exit_code: Some(code),
                ..
            } if *code > 0 => *code as u32,
            _ => 1,
        }
    }
}

impl From<GitError> for ProtocolError {
    fn from(err: GitError) -> Self {
        match err {
            GitError::IOError(e) => ProtocolError::Io(e),
            other => ProtocolError::backend(other.to_string()),
        }
    }
}

impl From<russh::Error> for ProtocolError {
    fn from(err: russh::Error) -> Self {
        ProtocolError::Handshake(err.to_string())
    }
}

/// Git service types for smart protocol
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ServiceKind {
    UploadPack,
    ReceivePack,
}

impl ServiceKind {
    /// Verb without the `git-` prefix, as the git binary expects it.
    pub fn verb(&self) -> &'static str {
        match self {
            ServiceKind::UploadPack => "upload-pack",
            ServiceKind::ReceivePack => "receive-pack",
        }
    }

    pub fn advertisement_content_type(&self) -> String {
        format!("application/x-{self}-advertisement")
    }

    pub fn result_content_type(&self) -> String {
        format!("application/x-{self}-result")
    }

    pub fn action(&self) -> Action {
        match self {
            ServiceKind::UploadPack => Action::Read,
            ServiceKind::ReceivePack => Action::Write,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServiceKind::UploadPack => write!(f, "git-upload-pack"),
            ServiceKind::ReceivePack => write!(f, "git-receive-pack"),
        }
    }
}

/// Accepts both `git-upload-pack` and the bare `upload-pack` form.
impl FromStr for ServiceKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("git-").unwrap_or(s) {
            "upload-pack" => Ok(ServiceKind::UploadPack),
            "receive-pack" => Ok(ServiceKind::ReceivePack),
            _ => Err(ProtocolError::invalid_service(s)),
        }
    }
}

/// What a session is about to do to a repository; the input of access checks.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Action {
    Read,
    Write,
}

/// Git protocol capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    MultiAck,
    MultiAckDetailed,
    NoDone,
    SideBand,
    SideBand64k,
    ReportStatus,
    ReportStatusv2,
    OfsDelta,
    ThinPack,
    Shallow,
    IncludeTag,
    DeleteRefs,
    Quiet,
    Atomic,
    NoThin,
    NoProgress,
    PushOptions,
    ObjectFormat(String),
    SessionId(String),
    Agent(String),
    Unknown(String),
}

impl Capability {
    /// Name without any `=value` part; two capabilities with the same name are duplicates.
    fn name(&self) -> String {
        let text = self.to_string();
        match text.split_once('=') {
            Some((name, _)) => name.to_string(),
            None => text,
        }
    }
}

impl FromStr for Capability {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("agent=") {
            return Ok(Capability::Agent(rest.to_string()));
        }
        if let Some(rest) = s.strip_prefix("session-id=") {
            return Ok(Capability::SessionId(rest.to_string()));
        }
        if let Some(rest) = s.strip_prefix("object-format=") {
            return Ok(Capability::ObjectFormat(rest.to_string()));
        }

        match s {
            "multi_ack" => Ok(Capability::MultiAck),
            "multi_ack_detailed" => Ok(Capability::MultiAckDetailed),
            "no-done" => Ok(Capability::NoDone),
            "side-band" => Ok(Capability::SideBand),
            "side-band-64k" => Ok(Capability::SideBand64k),
            "report-status" => Ok(Capability::ReportStatus),
            "report-status-v2" => Ok(Capability::ReportStatusv2),
            "ofs-delta" => Ok(Capability::OfsDelta),
            "thin-pack" => Ok(Capability::ThinPack),
            "shallow" => Ok(Capability::Shallow),
            "include-tag" => Ok(Capability::IncludeTag),
            "delete-refs" => Ok(Capability::DeleteRefs),
            "quiet" => Ok(Capability::Quiet),
            "atomic" => Ok(Capability::Atomic),
            "no-thin" => Ok(Capability::NoThin),
            "no-progress" => Ok(Capability::NoProgress),
            "push-options" => Ok(Capability::PushOptions),
            _ => Ok(Capability::Unknown(s.to_string())),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::MultiAck => write!(f, "multi_ack"),
            Capability::MultiAckDetailed => write!(f, "multi_ack_detailed"),
            Capability::NoDone => write!(f, "no-done"),
            Capability::SideBand => write!(f, "side-band"),
            Capability::SideBand64k => write!(f, "side-band-64k"),
            Capability::ReportStatus => write!(f, "report-status"),
            Capability::ReportStatusv2 => write!(f, "report-status-v2"),
            Capability::OfsDelta => write!(f, "ofs-delta"),
            Capability::ThinPack => write!(f, "thin-pack"),
            Capability::Shallow => write!(f, "shallow"),
            Capability::IncludeTag => write!(f, "include-tag"),
            Capability::DeleteRefs => write!(f, "delete-refs"),
            Capability::Quiet => write!(f, "quiet"),
            Capability::Atomic => write!(f, "atomic"),
            Capability::NoThin => write!(f, "no-thin"),
            Capability::NoProgress => write!(f, "no-progress"),
            Capability::PushOptions => write!(f, "push-options"),
            Capability::ObjectFormat(format) => write!(f, "object-format={format}"),
            Capability::SessionId(id) => write!(f, "session-id={id}"),
            Capability::Agent(agent) => write!(f, "agent={agent}"),
            Capability::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// Ordered capability list in which every capability name appears at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet(Vec<Capability>);

impl CapabilitySet {
    /// Capabilities the server declares for `service`.
    pub fn for_service(service: ServiceKind) -> Self {
        let mut caps = CapabilitySet::default();
        if service == ServiceKind::ReceivePack {
            caps.insert(Capability::ReportStatus);
            caps.insert(Capability::DeleteRefs);
        }
        caps.insert(Capability::NoThin);
        caps.insert(Capability::Agent(AGENT.to_string()));
        caps
    }

    /// Parse a space separated capability list as sent by clients.
    pub fn parse(s: &str) -> Self {
        let mut caps = CapabilitySet::default();
        for word in s.split_ascii_whitespace() {
            if let Ok(cap) = word.parse() {
                caps.insert(cap);
            }
        }
        caps
    }

    /// Add `cap`, replacing an existing capability of the same name. Returns false on replacement.
    pub fn insert(&mut self, cap: Capability) -> bool {
        let name = cap.name();
        match self.0.iter_mut().find(|c| c.name() == name) {
            Some(existing) => {
                *existing = cap;
                false
            }
            None => {
                self.0.push(cap);
                true
            }
        }
    }

    pub fn contains(&self, cap: &Capability) -> bool {
        self.0.contains(cap)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, cap) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{cap}")?;
        }
        Ok(())
    }
}

/// One advertised reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdvertisedRef {
    pub name: String,
    pub id: ObjectHash,
}

impl AdvertisedRef {
    pub fn new(name: impl Into<String>, id: ObjectHash) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

/// A decoded want/have negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadRequest {
    pub wants: Vec<ObjectHash>,
    /// `have` ids the server also has.
    pub commons: Vec<ObjectHash>,
    pub capabilities: CapabilitySet,
    pub done: bool,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CommandType {
    Create,
    Update,
    Delete,
}

/// Reference command for push operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefCommand {
    pub old_id: ObjectHash,
    pub new_id: ObjectHash,
    pub ref_name: String,
}

impl RefCommand {
    pub fn new(old_id: ObjectHash, new_id: ObjectHash, ref_name: impl Into<String>) -> Self {
        Self {
            old_id,
            new_id,
            ref_name: ref_name.into(),
        }
    }

    pub fn command_type(&self) -> CommandType {
        if self.new_id.is_zero() {
            CommandType::Delete
        } else if self.old_id.is_zero() {
            CommandType::Create
        } else {
            CommandType::Update
        }
    }
}

/// A decoded reference-update request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateRequest {
    pub commands: Vec<RefCommand>,
    pub capabilities: CapabilitySet,
}

impl UpdateRequest {
    /// A pack follows the commands unless every command is a delete.
    pub fn expects_pack(&self) -> bool {
        self.commands
            .iter()
            .any(|c| c.command_type() != CommandType::Delete)
    }

    pub fn wants_report(&self) -> bool {
        self.capabilities.contains(&Capability::ReportStatus)
    }
}

/// Outcome of one reference command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefStatus {
    pub ref_name: String,
    pub error: Option<String>,
}

impl RefStatus {
    pub fn ok(ref_name: impl Into<String>) -> Self {
        Self {
            ref_name: ref_name.into(),
            error: None,
        }
    }

    pub fn failed(ref_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            ref_name: ref_name.into(),
            error: Some(error.into()),
        }
    }

    pub fn get_status(&self) -> String {
        match &self.error {
            None => format!("ok {}", self.ref_name),
            Some(error) => format!("ng {} {}", self.ref_name, error),
        }
    }
}

/// The receive-pack status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportStatus {
    pub unpack: Result<(), String>,
    pub commands: Vec<RefStatus>,
}

impl ReportStatus {
    /// Report for a pack that could not be unpacked: every command fails.
    pub fn unpack_failed(request: &UpdateRequest, error: impl Into<String>) -> Self {
        Self {
            unpack: Err(error.into()),
            commands: request
                .commands
                .iter()
                .map(|c| RefStatus::failed(&c.ref_name, "unpacker error"))
                .collect(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.unpack.is_ok() && self.commands.iter().all(|c| c.error.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_kind_parsing() {
        assert_eq!("git-upload-pack".parse::<ServiceKind>().unwrap(), ServiceKind::UploadPack);
        assert_eq!("receive-pack".parse::<ServiceKind>().unwrap(), ServiceKind::ReceivePack);
        assert!("git-archive".parse::<ServiceKind>().is_err());
        assert_eq!(
            ServiceKind::UploadPack.advertisement_content_type(),
            "application/x-git-upload-pack-advertisement"
        );
        assert_eq!(
            ServiceKind::ReceivePack.result_content_type(),
            "application/x-git-receive-pack-result"
        );
        assert_eq!(ServiceKind::ReceivePack.verb(), "receive-pack");
    }

    #[test]
    fn test_capability_set_never_duplicates() {
        let mut caps = CapabilitySet::for_service(ServiceKind::ReceivePack);
        let before = caps.len();
        assert!(!caps.insert(Capability::NoThin));
        assert!(!caps.insert(Capability::Agent("other/1".to_string())));
        assert_eq!(caps.len(), before);
        assert_eq!(
            caps.to_string(),
            "report-status delete-refs no-thin agent=other/1"
        );
    }

    #[test]
    fn test_parse_client_capabilities() {
        let caps = CapabilitySet::parse("report-status side-band-64k agent=git/2.43.0 quiet quiet");
        assert!(caps.contains(&Capability::ReportStatus));
        assert!(caps.contains(&Capability::Agent("git/2.43.0".to_string())));
        assert_eq!(caps.len(), 4);
    }

    #[test]
    fn test_command_types_and_pack_expectation() {
        let a = ObjectHash::new(b"a");
        let b = ObjectHash::new(b"b");
        let mut request = UpdateRequest {
            commands: vec![RefCommand::new(a, ObjectHash::ZERO, "refs/heads/old")],
            capabilities: CapabilitySet::default(),
        };
        assert_eq!(request.commands[0].command_type(), CommandType::Delete);
        assert!(!request.expects_pack());
        request.commands.push(RefCommand::new(ObjectHash::ZERO, b, "refs/heads/new"));
        assert_eq!(request.commands[1].command_type(), CommandType::Create);
        assert!(request.expects_pack());
        assert!(!request.wants_report());
    }

    #[test]
    fn test_exit_status_mapping() {
        let err = ProtocolError::Backend {
            message: "boom".to_string(),
            exit_code: Some(128),
        };
        assert_eq!(err.exit_status(), 128);
        assert_eq!(ProtocolError::not_found("a/b").exit_status(), 1);
        assert_eq!(RefStatus::failed("refs/heads/x", "stale").get_status(), "ng refs/heads/x stale");
    }
}
