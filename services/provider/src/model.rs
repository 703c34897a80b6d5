//! Typed task and deployment records.
//!
//! Records are persisted as flat string maps whose field names are consumed
//! by external listing and reporting tools, so the conversions below are the
//! wire contract.

use std::fmt;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{Fields, StoreError};

/// Key prefix of proof task records.
pub const TASK_KEY_PREFIX: &str = "UBI-C2:";

/// Key prefix of space deployment records.
pub const SPACE_KEY_PREFIX: &str = "FULL:";

/// `create_time` layout.
pub const CREATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Reward placeholder until the reward service reports an amount.
pub const NO_REWARD: &str = "0.0";

pub fn task_key(task_id: &str) -> String {
    format!("{TASK_KEY_PREFIX}{task_id}")
}

pub fn space_key(space_uuid: &str) -> String {
    format!("{SPACE_KEY_PREFIX}{space_uuid}")
}

/// Proof task hardware class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskKind {
    Cpu,
    Gpu,
}

impl TaskKind {
    /// Map the wire `type` field (0 = CPU, 1 = GPU).
    pub fn from_type(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Cpu),
            1 => Some(Self::Gpu),
            _ => None,
        }
    }

    pub fn type_code(&self) -> u8 {
        match self {
            Self::Cpu => 0,
            Self::Gpu => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Gpu => "GPU",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CPU" | "0" => Some(Self::Cpu),
            "GPU" | "1" => Some(Self::Gpu),
            _ => None,
        }
    }

    pub fn is_accelerated(&self) -> bool {
        matches!(self, Self::Gpu)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proof task lifecycle.
///
/// `Received -> Running -> {Success, Failed}`; `Failed` is also reachable
/// straight from `Received`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Received,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(Self::Received),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a forward transition.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Received, Running | Success | Failed) => true,
            (Running, Success | Failed) => true,
            (Received, Received) | (Running, Running) => true,
            (Success | Failed, _) => false,
            (Running, Received) => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One proof task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub task_type: TaskKind,
    pub zk_type: String,
    pub tx: String,
    pub status: TaskStatus,
    pub reward: String,
    pub create_time: String,
}

impl TaskRecord {
    pub fn received(task_id: impl Into<String>, kind: TaskKind, zk_type: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: kind,
            zk_type: zk_type.into(),
            tx: String::new(),
            status: TaskStatus::Received,
            reward: NO_REWARD.to_string(),
            create_time: format_create_time(now),
        }
    }

    pub fn key(&self) -> String {
        task_key(&self.task_id)
    }

    pub fn to_fields(&self) -> Fields {
        Fields::from([
            ("task_id".to_string(), self.task_id.clone()),
            ("task_type".to_string(), self.task_type.as_str().to_string()),
            ("zk_type".to_string(), self.zk_type.clone()),
            ("tx".to_string(), self.tx.clone()),
            ("status".to_string(), self.status.as_str().to_string()),
            ("reward".to_string(), self.reward.clone()),
            ("create_time".to_string(), self.create_time.clone()),
        ])
    }

    pub fn from_fields(key: &str, fields: &Fields) -> Result<Self, StoreError> {
        let field = |name: &str| fields.get(name).cloned().unwrap_or_default();
        let invalid = |reason: String| StoreError::Invalid {
            key: key.to_string(),
            reason,
        };

        let task_type = TaskKind::parse(&field("task_type"))
            .ok_or_else(|| invalid(format!("unknown task_type '{}'", field("task_type"))))?;
        let status = TaskStatus::parse(&field("status"))
            .ok_or_else(|| invalid(format!("unknown status '{}'", field("status"))))?;
        let reward = match field("reward") {
            r if r.is_empty() => NO_REWARD.to_string(),
            r => r,
        };

        Ok(Self {
            task_id: field("task_id"),
            task_type,
            zk_type: field("zk_type"),
            tx: field("tx"),
            status,
            reward,
            create_time: field("create_time"),
        })
    }
}

pub fn format_create_time(now: DateTime<Utc>) -> String {
    now.with_timezone(&Local).format(CREATE_TIME_FORMAT).to_string()
}

/// A deployed space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceDeployment {
    pub wallet_address: String,
    pub space_name: String,
    /// Unix seconds.
    pub expire_time: i64,
    pub space_uuid: String,
    pub job_uuid: String,
    pub task_type: String,
    pub deploy_name: String,
    pub hardware: String,
    pub task_uuid: String,
}

impl SpaceDeployment {
    pub fn key(&self) -> String {
        space_key(&self.space_uuid)
    }

    /// Per-wallet namespace holding the space's objects.
    pub fn namespace(&self) -> String {
        crate::pipeline::names::namespace(&self.wallet_address)
    }

    /// Seconds until expiry; negative once expired.
    pub fn left_seconds(&self, now: i64) -> i64 {
        self.expire_time - now
    }

    pub fn to_fields(&self) -> Fields {
        Fields::from([
            ("wallet_address".to_string(), self.wallet_address.clone()),
            ("space_name".to_string(), self.space_name.clone()),
            ("expire_time".to_string(), self.expire_time.to_string()),
            ("space_uuid".to_string(), self.space_uuid.clone()),
            ("job_uuid".to_string(), self.job_uuid.clone()),
            ("task_type".to_string(), self.task_type.clone()),
            ("deploy_name".to_string(), self.deploy_name.clone()),
            ("hardware".to_string(), self.hardware.clone()),
            ("task_uuid".to_string(), self.task_uuid.clone()),
        ])
    }

    pub fn from_fields(key: &str, fields: &Fields) -> Result<Self, StoreError> {
        let field = |name: &str| fields.get(name).cloned().unwrap_or_default();
        let expire_raw = field("expire_time");
        let expire_time = if expire_raw.trim().is_empty() {
            0
        } else {
            expire_raw.trim().parse().map_err(|_| StoreError::Invalid {
                key: key.to_string(),
                reason: format!("invalid expire_time '{expire_raw}'"),
            })?
        };

        Ok(Self {
            wallet_address: field("wallet_address"),
            space_name: field("space_name"),
            expire_time,
            space_uuid: field("space_uuid"),
            job_uuid: field("job_uuid"),
            task_type: field("task_type"),
            deploy_name: field("deploy_name"),
            hardware: field("hardware"),
            task_uuid: field("task_uuid"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;
        assert!(Received.can_transition_to(Running));
        assert!(Received.can_transition_to(Failed));
        assert!(Running.can_transition_to(Success));
        assert!(!Running.can_transition_to(Received));
        assert!(!Success.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Running));
    }

    #[test]
    fn test_task_record_fields_roundtrip() {
        let mut record = TaskRecord::received("42", TaskKind::Gpu, "fil-c2-512M", Utc::now());
        record.status = TaskStatus::Success;
        record.tx = "0xabc".into();

        let fields = record.to_fields();
        assert_eq!(fields.get("task_type").map(String::as_str), Some("GPU"));
        assert_eq!(fields.get("status").map(String::as_str), Some("success"));

        let back = TaskRecord::from_fields(&record.key(), &fields).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_task_record_missing_reward_defaults() {
        let mut fields = TaskRecord::received("1", TaskKind::Cpu, "z", Utc::now()).to_fields();
        fields.remove("reward");
        let record = TaskRecord::from_fields("UBI-C2:1", &fields).unwrap();
        assert_eq!(record.reward, NO_REWARD);
    }

    #[test]
    fn test_task_record_rejects_unknown_status() {
        let mut fields = TaskRecord::received("1", TaskKind::Cpu, "z", Utc::now()).to_fields();
        fields.insert("status".into(), "bogus".into());
        assert!(matches!(
            TaskRecord::from_fields("UBI-C2:1", &fields),
            Err(StoreError::Invalid { .. })
        ));
    }

    #[test]
    fn test_space_fields_roundtrip() {
        let space = SpaceDeployment {
            wallet_address: "0xAbC".into(),
            space_name: "demo".into(),
            expire_time: 1_700_000_000,
            space_uuid: "uuid-1".into(),
            job_uuid: "job-1".into(),
            task_type: "GPU".into(),
            deploy_name: "deploy-uuid-1".into(),
            hardware: "NVIDIA 3090 · 4 vCPU · 16 GiB".into(),
            task_uuid: "task-1".into(),
        };
        let back = SpaceDeployment::from_fields(&space.key(), &space.to_fields()).unwrap();
        assert_eq!(back, space);
        assert_eq!(space.namespace(), "ns-0xabc");
    }

    #[test]
    fn test_keys() {
        assert_eq!(task_key("7"), "UBI-C2:7");
        assert_eq!(space_key("abc"), "FULL:abc");
    }
}
