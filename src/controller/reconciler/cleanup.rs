//! Deletion of workspace-owned objects when a workspace stops with
//! cleanup-on-stop enabled.

use crate::cluster::{StoreError, WorkspaceStore};
use crate::crd::DevWorkspace;
use tracing::{debug, info};

/// Delete every labelled object owned solely by `workspace`
///
/// Objects with no owner reference, or with owners besides the workspace,
/// are left alone. Returns the number of objects deleted this call.
///
/// # Errors
///
/// Propagates list and delete failures from the store.
pub async fn delete_owned_objects(
    store: &dyn WorkspaceStore,
    workspace: &DevWorkspace,
) -> Result<usize, StoreError> {
    let namespace = workspace.metadata.namespace.as_deref().unwrap_or_default();
    let uid = workspace.uid();
    let objects = store
        .list_owned_objects(namespace, workspace.workspace_id())
        .await?;

    let mut deleted = 0;
    for object in &objects {
        if !object.solely_owned_by(uid) {
            debug!(
                "Leaving {} {}/{} in place: not solely owned by {}",
                object.kind,
                object.namespace,
                object.name,
                workspace.key()
            );
            continue;
        }
        store.delete_object(object).await?;
        info!("🧹 Deleted {} {}/{}", object.kind, object.namespace, object.name);
        deleted += 1;
    }
    Ok(deleted)
}
