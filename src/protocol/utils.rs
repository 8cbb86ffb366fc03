//! Message level helpers on top of pkt-line framing: the reference advertisement, upload request
//! lines, reference-update commands and the receive-pack status report. Both the transport session
//! and the subprocess backend (which talks the same protocol to the git binary) use them.

use bytes::{Bytes, BytesMut};

use super::{
    pktline::{PktLine, add_flush, add_pkt_line, add_pkt_line_string, read_all_pkt_lines},
    types::{AdvertisedRef, CapabilitySet, ProtocolError, RefCommand, RefStatus, ReportStatus, ServiceKind},
};
use crate::hash::ObjectHash;

pub const NUL: u8 = b'\0';

/// Name git advertises in place of a ref when a repository has none.
pub const CAPABILITIES_PLACEHOLDER: &str = "capabilities^{}";

/// A decoded reference advertisement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// Service named by the `# service=` comment, when one was present.
    pub service: Option<String>,
    pub refs: Vec<AdvertisedRef>,
    pub capabilities: CapabilitySet,
}

/// Encode a full advertisement section.
///
/// With `service_header` set the section starts with `# service=<name>` and a flush, the smart
/// HTTP form. The section always ends with a flush.
pub fn build_advertisement(
    service: ServiceKind,
    refs: &[AdvertisedRef],
    capabilities: &CapabilitySet,
    service_header: bool,
) -> Result<BytesMut, ProtocolError> {
    let mut stream = BytesMut::new();
    if service_header {
        add_pkt_line_string(&mut stream, &format!("# service={service}\n"))?;
        add_flush(&mut stream);
    }

    match refs.split_first() {
        None => {
            let line = format!(
                "{} {CAPABILITIES_PLACEHOLDER}\0{capabilities}\n",
                ObjectHash::ZERO
            );
            add_pkt_line_string(&mut stream, &line)?;
        }
        Some((first, rest)) => {
            add_pkt_line_string(
                &mut stream,
                &format!("{} {}\0{capabilities}\n", first.id, first.name),
            )?;
            for r in rest {
                add_pkt_line_string(&mut stream, &format!("{} {}\n", r.id, r.name))?;
            }
        }
    }
    add_flush(&mut stream);
    Ok(stream)
}

/// Decode an advertisement produced by [`build_advertisement`] or by `git --advertise-refs`.
pub fn parse_advertisement(bytes: Bytes) -> Result<Advertisement, ProtocolError> {
    let mut advertisement = Advertisement::default();
    let mut lines = read_all_pkt_lines(bytes)?.into_iter().peekable();

    if let Some(PktLine::Data(first)) = lines.peek() {
        if let Some(service) = first.strip_prefix(b"# service=") {
            let service = service.strip_suffix(b"\n").unwrap_or(service);
            advertisement.service = Some(String::from_utf8_lossy(service).into_owned());
            lines.next();
            match lines.next() {
                Some(PktLine::Flush) => {}
                _ => return Err(ProtocolError::decode("missing flush after service line")),
            }
        }
    }

    let mut seen_caps = false;
    for line in lines {
        let Some(text) = line.text() else {
            break;
        };
        let (ref_part, caps) = match memchr::memchr(NUL, text) {
            Some(pos) => (&text[..pos], Some(&text[pos + 1..])),
            None => (text, None),
        };
        if let Some(caps) = caps {
            if seen_caps {
                return Err(ProtocolError::decode("capabilities advertised twice"));
            }
            seen_caps = true;
            advertisement.capabilities = CapabilitySet::parse(&String::from_utf8_lossy(caps));
        }

        let (id, name) = split_id_and_name(ref_part)?;
        if name == CAPABILITIES_PLACEHOLDER {
            continue;
        }
        advertisement.refs.push(AdvertisedRef::new(name, id));
    }
    Ok(advertisement)
}

fn split_id_and_name(line: &[u8]) -> Result<(ObjectHash, String), ProtocolError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ProtocolError::decode("advertised ref is not valid UTF-8"))?;
    let (id, name) = text
        .split_once(' ')
        .ok_or_else(|| ProtocolError::decode(format!("malformed ref line `{text}`")))?;
    Ok((parse_oid(id)?, name.to_string()))
}

pub fn parse_oid(text: &str) -> Result<ObjectHash, ProtocolError> {
    text.parse::<ObjectHash>().map_err(ProtocolError::decode)
}

/// One client line of the upload-pack negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadLine {
    Want(ObjectHash, Option<CapabilitySet>),
    Have(ObjectHash),
    Done,
}

pub fn parse_upload_line(text: &[u8]) -> Result<UploadLine, ProtocolError> {
    let text = std::str::from_utf8(text)
        .map_err(|_| ProtocolError::decode("negotiation line is not valid UTF-8"))?;
    if text == "done" {
        return Ok(UploadLine::Done);
    }
    if let Some(rest) = text.strip_prefix("want ") {
        let (id, caps) = match rest.split_once(' ') {
            Some((id, caps)) => (id, Some(CapabilitySet::parse(caps))),
            None => (rest, None),
        };
        return Ok(UploadLine::Want(parse_oid(id)?, caps));
    }
    if let Some(id) = text.strip_prefix("have ") {
        return Ok(UploadLine::Have(parse_oid(id.trim_end())?));
    }
    let keyword = text.split(' ').next().unwrap_or(text);
    match keyword {
        "shallow" | "deepen" | "deepen-since" | "deepen-not" => Err(
            ProtocolError::UnsupportedRequest(format!("{keyword} (shallow clones)")),
        ),
        _ => Err(ProtocolError::decode(format!("unexpected negotiation line `{text}`"))),
    }
}

/// Parse `<old> <new> <ref>[\0<caps>]`.
pub fn parse_ref_command(text: &[u8]) -> Result<(RefCommand, Option<CapabilitySet>), ProtocolError> {
    let (command, caps) = match memchr::memchr(NUL, text) {
        Some(pos) => (
            &text[..pos],
            Some(CapabilitySet::parse(&String::from_utf8_lossy(&text[pos + 1..]))),
        ),
        None => (text, None),
    };
    let command = std::str::from_utf8(command)
        .map_err(|_| ProtocolError::decode("ref command is not valid UTF-8"))?;
    let mut parts = command.splitn(3, ' ');
    let (Some(old), Some(new), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ProtocolError::decode(format!("malformed ref command `{command}`")));
    };
    if name.is_empty() {
        return Err(ProtocolError::decode("ref command without a ref name"));
    }
    Ok((RefCommand::new(parse_oid(old)?, parse_oid(new)?, name), caps))
}

/// Encode reference-update commands, capabilities on the first one, followed by a flush.
pub fn build_ref_commands(
    commands: &[RefCommand],
    capabilities: &CapabilitySet,
) -> Result<BytesMut, ProtocolError> {
    let mut stream = BytesMut::new();
    for (i, c) in commands.iter().enumerate() {
        let mut line = format!("{} {} {}", c.old_id, c.new_id, c.ref_name).into_bytes();
        if i == 0 && !capabilities.is_empty() {
            line.push(NUL);
            line.extend_from_slice(capabilities.to_string().as_bytes());
        }
        line.push(b'\n');
        add_pkt_line(&mut stream, &line)?;
    }
    add_flush(&mut stream);
    Ok(stream)
}

/// Encode a status report followed by a flush.
pub fn build_report_status(report: &ReportStatus) -> Result<BytesMut, ProtocolError> {
    let mut stream = BytesMut::new();
    let unpack = match &report.unpack {
        Ok(()) => "unpack ok\n".to_string(),
        Err(e) => format!("unpack {}\n", single_line(e)),
    };
    add_pkt_line_string(&mut stream, &unpack)?;
    for status in &report.commands {
        let line = match &status.error {
            None => format!("ok {}\n", status.ref_name),
            Some(e) => format!("ng {} {}\n", status.ref_name, single_line(e)),
        };
        add_pkt_line_string(&mut stream, &line)?;
    }
    add_flush(&mut stream);
    Ok(stream)
}

/// Decode a status report section (without the final flush).
pub fn parse_report_status(lines: &[PktLine]) -> Result<ReportStatus, ProtocolError> {
    let mut texts = lines.iter().filter_map(PktLine::text);
    let unpack = texts
        .next()
        .and_then(|t| t.strip_prefix(b"unpack "))
        .ok_or_else(|| ProtocolError::decode("status report without unpack line"))?;
    let unpack = match unpack {
        b"ok" => Ok(()),
        err => Err(String::from_utf8_lossy(err).into_owned()),
    };

    let mut commands = Vec::new();
    for text in texts {
        let text = String::from_utf8_lossy(text);
        if let Some(name) = text.strip_prefix("ok ") {
            commands.push(RefStatus::ok(name));
        } else if let Some(rest) = text.strip_prefix("ng ") {
            let (name, reason) = rest.split_once(' ').unwrap_or((rest, "failed"));
            commands.push(RefStatus::failed(name, reason));
        } else {
            return Err(ProtocolError::decode(format!("unexpected status line `{text}`")));
        }
    }
    Ok(ReportStatus { unpack, commands })
}

/// Messages go into one pkt-line each.
fn single_line(message: &str) -> String {
    message.replace(['\n', '\r'], " ")
}
