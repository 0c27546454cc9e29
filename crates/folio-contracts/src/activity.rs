use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::catalog::Category;
use crate::error::{StoreError, StoreResult};
use crate::usage::TokenUsage;

pub const ACTIVITY_FILE: &str = "activity.jsonl";

/// One line of the project's activity log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Activity {
    ImageAdded {
        image_id: String,
        category: Category,
        path: String,
    },
    ImageGenerated {
        image_id: String,
        category: Category,
        path: String,
        model: String,
        usage: Option<TokenUsage>,
    },
    ImageReworked {
        image_id: String,
        source_id: String,
        category: Category,
        path: String,
        model: String,
        usage: Option<TokenUsage>,
    },
    ImageMoved {
        image_id: String,
        from: Category,
        to: Category,
        path: String,
    },
    ImageDeleted {
        image_id: String,
        path: String,
    },
    PagesReordered {
        order: Vec<String>,
    },
    UsageReset {
        previous_total_tokens: u64,
    },
}

/// Append-only writer for `activity.jsonl`.
///
/// Every line carries `type`, `session_id` and `ts` next to the activity's own
/// fields, one compact JSON object per line.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    inner: Arc<ActivityLogInner>,
}

#[derive(Debug)]
struct ActivityLogInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl ActivityLog {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ActivityLogInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    /// Log under `root` with a fresh session id.
    pub fn for_project(root: &Path) -> Self {
        Self::new(root.join(ACTIVITY_FILE), Uuid::new_v4().to_string())
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn record(&self, activity: &Activity) -> StoreResult<Value> {
        let path = &self.inner.path;
        let mut line = serde_json::to_value(activity).map_err(|err| StoreError::json(path, err))?;
        if let Value::Object(fields) = &mut line {
            fields.insert(
                "session_id".to_string(),
                Value::String(self.inner.session_id.clone()),
            );
            fields.insert("ts".to_string(), Value::String(now_utc_iso()));
        }
        let rendered = serde_json::to_string(&line).map_err(|err| StoreError::json(path, err))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| StoreError::io(parent, err))?;
        }
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| StoreError::Poisoned("activity log"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| StoreError::io(path, err))?;
        file.write_all(rendered.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .map_err(|err| StoreError::io(path, err))?;
        Ok(line)
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::Value;

    use super::{Activity, ActivityLog};
    use crate::catalog::Category;

    #[test]
    fn record_writes_one_tagged_line_per_activity() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let log = ActivityLog::new(temp.path().join("activity.jsonl"), "session-1");

        let written = log.record(&Activity::ImageMoved {
            image_id: "abc".to_string(),
            from: Category::Page,
            to: Category::Character,
            path: "characters/hero.png".to_string(),
        })?;
        log.record(&Activity::PagesReordered {
            order: vec!["b".to_string(), "a".to_string()],
        })?;

        let content = fs::read_to_string(log.path())?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0])?;
        assert_eq!(first, written);
        assert_eq!(first["type"], "image_moved");
        assert_eq!(first["from"], "page");
        assert_eq!(first["to"], "character");
        assert_eq!(first["session_id"], "session-1");
        DateTime::parse_from_rfc3339(first["ts"].as_str().unwrap_or(""))?;

        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(second["type"], "pages_reordered");
        assert_eq!(second["order"][0], "b");
        Ok(())
    }

    #[test]
    fn project_logs_get_distinct_sessions() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let first = ActivityLog::for_project(temp.path());
        let second = ActivityLog::for_project(temp.path());
        assert_ne!(first.session_id(), second.session_id());
        assert_eq!(first.path(), temp.path().join("activity.jsonl"));
        Ok(())
    }
}
