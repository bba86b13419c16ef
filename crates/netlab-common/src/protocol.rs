//! Command protocol between the controller and the per-machine agent.
//!
//! Every message is a JSON [`Frame`]: the controller sends `request` frames,
//! the agent answers each with a `reply` frame carrying the same id, and
//! pushes `event` frames (device created/deleted, job finished) at any time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::models::{DeviceInfo, HwAddr, IpAddress, LinkSpec};

// ── Frames ──────────────────────────────────────────────────────────

/// The outer envelope for all channel messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Request { id: String, request: Request },
    Reply { id: String, reply: Reply },
    Event { ts: DateTime<Utc>, event: AgentEvent },
}

impl Frame {
    pub fn event(event: AgentEvent) -> Self {
        Frame::Event {
            ts: Utc::now(),
            event,
        }
    }
}

// ── Controller → Agent ──────────────────────────────────────────────

/// Every operation the controller can invoke on an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    Hello,
    SetRecipe {
        name: String,
    },
    GetDevices,
    GetDevice {
        if_index: u32,
    },
    GetDeviceByName {
        name: String,
    },
    GetDeviceByHwaddr {
        hwaddr: HwAddr,
    },
    GetDevicesByParams {
        params: BTreeMap<String, serde_json::Value>,
    },
    DevAttr {
        if_index: u32,
        attr: DeviceAttr,
    },
    DevMethod {
        if_index: u32,
        call: DeviceCall,
    },
    CreateDevice {
        spec: LinkSpec,
    },
    DestroyDevices,
    AssignName {
        prefix: String,
    },
    AssignNamePair {
        prefix: String,
    },
    SetSystemOption {
        path: String,
        value: String,
        #[serde(default)]
        persistent: bool,
    },
    RestoreSystemConfig,
    RunJob {
        job: JobSpec,
    },
    WaitJob {
        id: u64,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    KillJob {
        id: u64,
        signal: JobSignal,
    },
    KillJobs,
    Bye,
}

/// Coarse category of a request, used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Configure,
    Run,
    Wait,
    Interrupt,
    Kill,
}

impl Request {
    pub fn kind(&self) -> CommandKind {
        match self {
            Request::RunJob { .. } => CommandKind::Run,
            Request::WaitJob { .. } => CommandKind::Wait,
            Request::KillJob {
                signal: JobSignal::Interrupt,
                ..
            } => CommandKind::Interrupt,
            Request::KillJob { .. } | Request::KillJobs => CommandKind::Kill,
            _ => CommandKind::Configure,
        }
    }

    /// Method name as it appears on the wire.
    pub fn method(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.get("method").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_default()
    }
}

/// Readable device attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAttr {
    Name,
    Hwaddr,
    Mtu,
    State,
    Ips,
    Master,
    Driver,
    LinkHeaderType,
    LinkStats,
    Devlink,
    Info,
}

/// Device operations invoked through the command channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeviceCall {
    SetMtu { mtu: u32 },
    SetMaster { master: Option<u32> },
    IpAdd { addr: IpAddress },
    IpDel { addr: IpAddress },
    IpFlush,
    Up,
    Down,
    SpeedSet { speed: u32 },
    AutonegOn,
    AutonegOff,
    Cleanup,
    Enable,
    Disable,
}

// ── Jobs ────────────────────────────────────────────────────────────

/// A shell command executed on the machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub command: String,
    /// Run without waiting; the reply carries the job id.
    #[serde(default)]
    pub background: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSignal {
    Interrupt,
    Terminate,
    Kill,
}

/// Outcome of a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub passed: bool,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// Answer to `hello`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub version: String,
    pub hostname: String,
    pub kernel_release: Option<String>,
}

// ── Agent → Controller ──────────────────────────────────────────────

/// Result of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub passed: bool,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl Reply {
    pub fn ok(result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Reply {
                passed: true,
                result,
                error: None,
            },
            Err(e) => Reply::err(RemoteError::other(format!("result serialization: {e}"))),
        }
    }

    pub fn err(error: impl Into<RemoteError>) -> Self {
        Reply {
            passed: false,
            result: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }

    pub fn into_result(self) -> Result<serde_json::Value, RemoteError> {
        if self.passed {
            Ok(self.result)
        } else {
            Err(self
                .error
                .unwrap_or_else(|| RemoteError::other("command failed without error detail")))
        }
    }
}

/// Asynchronous notifications pushed by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    DevCreated { info: DeviceInfo },
    DevDeleted { if_index: u32 },
    JobFinished { id: u64, result: JobResult },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeviceError, RemoteErrorKind};

    #[test]
    fn request_frame_tagged_serialization() {
        let frame = Frame::Request {
            id: "req_1".into(),
            request: Request::DevMethod {
                if_index: 4,
                call: DeviceCall::SetMtu { mtu: 9000 },
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"request\""));
        assert!(json.contains("\"method\":\"dev_method\""));
        assert!(json.contains("\"op\":\"set_mtu\""));

        match serde_json::from_str::<Frame>(&json).unwrap() {
            Frame::Request { id, request } => {
                assert_eq!(id, "req_1");
                assert_eq!(request.method(), "dev_method");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unit_requests_serialize() {
        let json = serde_json::to_string(&Request::DestroyDevices).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Request::DestroyDevices);
    }

    #[test]
    fn request_kinds() {
        let run = Request::RunJob {
            job: JobSpec {
                command: "true".into(),
                background: false,
            },
        };
        assert_eq!(run.kind(), CommandKind::Run);
        let int = Request::KillJob {
            id: 1,
            signal: JobSignal::Interrupt,
        };
        assert_eq!(int.kind(), CommandKind::Interrupt);
        assert_eq!(Request::KillJobs.kind(), CommandKind::Kill);
        assert_eq!(Request::RestoreSystemConfig.kind(), CommandKind::Configure);
    }

    #[test]
    fn reply_into_result() {
        assert_eq!(
            Reply::ok(42).into_result().unwrap(),
            serde_json::json!(42)
        );

        let err = Reply::err(DeviceError::NotFound).into_result().unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::NotFound);

        let bare = Reply {
            passed: false,
            result: serde_json::Value::Null,
            error: None,
        };
        assert_eq!(bare.into_result().unwrap_err().kind, RemoteErrorKind::Other);
    }

    #[test]
    fn event_frame_serialization() {
        let frame = Frame::event(AgentEvent::DevDeleted { if_index: 9 });
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"kind\":\"dev_deleted\""));
        match serde_json::from_str::<Frame>(&json).unwrap() {
            Frame::Event { event, .. } => assert_eq!(event, AgentEvent::DevDeleted { if_index: 9 }),
            _ => panic!("wrong variant"),
        }
    }
}
