//! Object enumeration for fetches.

use std::collections::{HashSet, VecDeque};

use tracing::debug;

use super::odb::ObjectDatabase;
use crate::{
    errors::GitError,
    hash::ObjectHash,
    internal::object::{
        ObjectTrait,
        commit::Commit,
        tag::Tag,
        tree::{Tree, TreeItemMode},
        types::ObjectType,
    },
};

/// Every object reachable from `tips` that is not in `exclude`, in discovery order.
///
/// Blobs are recorded from tree entries without being read. Submodule entries point into
/// other repositories and are skipped.
pub async fn reachable_objects(
    odb: &ObjectDatabase,
    tips: &[ObjectHash],
    exclude: &HashSet<ObjectHash>,
) -> Result<Vec<(ObjectHash, ObjectType)>, GitError> {
    let mut seen: HashSet<ObjectHash> = HashSet::new();
    let mut queue: VecDeque<ObjectHash> = tips.iter().copied().collect();
    let mut found = Vec::new();

    while let Some(id) = queue.pop_front() {
        if exclude.contains(&id) || !seen.insert(id) {
            continue;
        }
        let (obj_type, data) = odb.expect_object(&id).await?;
        found.push((id, obj_type));
        match obj_type {
            ObjectType::Commit => {
                let commit = Commit::from_bytes(&data, id)?;
                queue.push_back(commit.tree_id);
                queue.extend(commit.parent_commit_ids);
            }
            ObjectType::Tree => {
                let tree = Tree::from_bytes(&data, id)?;
                for item in tree.tree_items {
                    match item.mode {
                        TreeItemMode::Commit => {}
                        TreeItemMode::Tree => queue.push_back(item.id),
                        _ => {
                            if !exclude.contains(&item.id) && seen.insert(item.id) {
                                found.push((item.id, ObjectType::Blob));
                            }
                        }
                    }
                }
            }
            ObjectType::Tag => {
                let tag = Tag::from_bytes(&data, id)?;
                queue.push_back(tag.object_hash);
            }
            _ => {}
        }
    }
    Ok(found)
}

/// Objects a fetch has to send: reachable from `wants`, minus everything reachable from `commons`.
pub async fn objects_to_send(
    odb: &ObjectDatabase,
    wants: &[ObjectHash],
    commons: &[ObjectHash],
) -> Result<Vec<(ObjectHash, ObjectType)>, GitError> {
    let exclude: HashSet<ObjectHash> = reachable_objects(odb, commons, &HashSet::new())
        .await?
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    let objects = reachable_objects(odb, wants, &exclude).await?;
    debug!(
        wants = wants.len(),
        commons = commons.len(),
        excluded = exclude.len(),
        objects = objects.len(),
        "enumerated objects"
    );
    Ok(objects)
}

/// Follow tags until a non-tag object.
pub async fn peel(odb: &ObjectDatabase, id: &ObjectHash) -> Result<Option<ObjectHash>, GitError> {
    let mut current = *id;
    let mut peeled = false;
    // tag chains are short; the bound stops cycles in corrupt stores
    for _ in 0..32 {
        match odb.read_object(&current).await? {
            Some((ObjectType::Tag, data)) => {
                current = Tag::from_bytes(&data, current)?.object_hash;
                peeled = true;
            }
            Some(_) => return Ok(peeled.then_some(current)),
            None => return Ok(None),
        }
    }
    Err(GitError::InvalidTagObject(format!("{id}: tag chain too deep")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        internal::object::tree::TreeItem,
        storage::{Filesystem, MemFs},
    };

    const SIG: &str = "A U Thor <author@example.com> 1700000000 +0000";

    async fn commit_with_file(
        odb: &ObjectDatabase,
        content: &[u8],
        parents: Vec<ObjectHash>,
    ) -> (ObjectHash, ObjectHash, ObjectHash) {
        let blob = odb.write_object(ObjectType::Blob, content).await.unwrap();
        let tree = Tree::from_tree_items(vec![TreeItem {
            mode: TreeItemMode::Blob,
            id: blob,
            name: b"file.txt".to_vec(),
        }]);
        odb.write_object(ObjectType::Tree, &tree.to_data()).await.unwrap();
        let commit = Commit::new(tree.id, parents, SIG, "change");
        odb.write_object(ObjectType::Commit, &commit.to_data())
            .await
            .unwrap();
        (commit.id, tree.id, blob)
    }

    #[tokio::test]
    async fn test_objects_to_send_excludes_commons() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemFs::new());
        let odb = ObjectDatabase::new(fs);
        let (first, first_tree, first_blob) = commit_with_file(&odb, b"one\n", vec![]).await;
        let (second, second_tree, second_blob) =
            commit_with_file(&odb, b"two\n", vec![first]).await;

        let all = objects_to_send(&odb, &[second], &[]).await.unwrap();
        assert_eq!(all.len(), 6);
        assert_eq!(all[0], (second, ObjectType::Commit));

        let delta: Vec<_> = objects_to_send(&odb, &[second], &[first])
            .await
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(delta, vec![second, second_tree, second_blob]);
        assert!(!delta.contains(&first_tree));
        assert!(!delta.contains(&first_blob));
    }

    #[tokio::test]
    async fn test_peel_annotated_tag() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemFs::new());
        let odb = ObjectDatabase::new(fs);
        let (commit, _, _) = commit_with_file(&odb, b"one\n", vec![]).await;
        let tag = Tag::new(commit, ObjectType::Commit, "v1", SIG, "release");
        odb.write_object(ObjectType::Tag, &tag.to_data()).await.unwrap();

        assert_eq!(peel(&odb, &tag.id).await.unwrap(), Some(commit));
        assert_eq!(peel(&odb, &commit).await.unwrap(), None);

        let sent = objects_to_send(&odb, &[tag.id], &[]).await.unwrap();
        assert_eq!(sent[0], (tag.id, ObjectType::Tag));
        assert_eq!(sent.len(), 4);
    }
}
