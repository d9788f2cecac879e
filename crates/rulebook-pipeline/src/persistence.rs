//! Save and restore activities between invocations.
//!
//! A suspended activity carries its [`PendingResume`](rulebook_types::PendingResume),
//! so writing it with [`save_activity`] and reading it back with
//! [`load_activity`] is enough to resume by token after a restart.

use std::path::{Path, PathBuf};

use rulebook_types::Result;
use serde::{Deserialize, Serialize};

use crate::activity::Activity;

const FILE_NAME: &str = "activity.json";

/// On-disk envelope for an activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedActivity {
    pub activity: Activity,
    /// RFC 3339 timestamp of the save.
    pub saved_at: String,
}

impl SavedActivity {
    pub fn new(activity: Activity) -> Self {
        Self {
            activity,
            saved_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Write the activity to `<dir>/activity.json`, creating `dir` if needed.
pub async fn save_activity(activity: &Activity, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(FILE_NAME);
    let json = serde_json::to_string_pretty(&SavedActivity::new(activity.clone()))?;
    tokio::fs::write(&path, json).await?;
    tracing::debug!(path = %path.display(), activity = %activity.id, "Activity saved");
    Ok(path)
}

/// Read the activity saved in `dir`. `Ok(None)` when nothing was saved.
pub async fn load_activity(dir: &Path) -> Result<Option<Activity>> {
    let path = dir.join(FILE_NAME);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(&path).await?;
    let saved: SavedActivity = serde_json::from_str(&json)?;
    tracing::debug!(
        path = %path.display(),
        saved_at = %saved.saved_at,
        "Activity loaded"
    );
    Ok(Some(saved.activity))
}

/// Drop the pending prompt (and the charged set) of a saved activity.
/// Returns whether anything was pending.
pub async fn clear_pending(dir: &Path) -> Result<bool> {
    let Some(mut activity) = load_activity(dir).await? else {
        return Ok(false);
    };
    let had_pending = activity.pending.take().is_some();
    activity.charged.clear();
    save_activity(&activity, dir).await?;
    Ok(had_pending)
}
