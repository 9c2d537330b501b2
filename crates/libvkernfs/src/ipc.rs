//! Control plane: the runtime registers and unregisters containers over a
//! local Unix socket carrying newline-delimited JSON records.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::VkernError;
use crate::state::{ContainerStore, RegistrationRecord};
use crate::Result;

pub const DEFAULT_SOCKET_PATH: &str = "/run/vkernfs/vkernfs.sock";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ControlRequest {
    PreRegister {
        id: String,
        netns_path: Option<PathBuf>,
    },
    Register {
        id: String,
        record: RegistrationRecord,
    },
    Update {
        id: String,
        record: RegistrationRecord,
    },
    Unregister {
        id: String,
    },
    StoreSize,
    ContainerInfo {
        id: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub init_pid: Option<i32>,
    pub netns_inode: u64,
    pub reg_completed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ControlResponse {
    Ok,
    Size(usize),
    Container(ContainerSummary),
    Error { kind: String, message: String },
}

/// Folds a store operation result into the wire response.
fn respond<T, F>(result: Result<T>, on_ok: F) -> ControlResponse
where
    F: FnOnce(T) -> ControlResponse,
{
    match result {
        Ok(value) => on_ok(value),
        Err(err) => ControlResponse::Error {
            kind: error_kind(&err).to_string(),
            message: err.to_string(),
        },
    }
}

fn error_kind(err: &VkernError) -> &'static str {
    match err {
        VkernError::NotFound(_) => "not_found",
        VkernError::AlreadyExists(_) => "already_exists",
        VkernError::PermissionDenied(_) => "permission_denied",
        VkernError::Invalid(_) => "invalid",
        VkernError::Io(_) => "io",
        VkernError::NamespaceEnter(_) => "namespace_enter",
        VkernError::Timeout => "timeout",
        VkernError::Internal(_) => "internal",
    }
}

/// Applies one control request to the store.
pub fn dispatch(store: &ContainerStore, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::PreRegister { id, netns_path } => respond(
            store.pre_register(&id, netns_path.as_deref()),
            |_| ControlResponse::Ok,
        ),
        ControlRequest::Register { id, record } => {
            respond(store.register(&id, &record), |()| ControlResponse::Ok)
        }
        ControlRequest::Update { id, record } => {
            respond(store.update(&id, &record), |()| ControlResponse::Ok)
        }
        ControlRequest::Unregister { id } => {
            respond(store.unregister(&id), |()| ControlResponse::Ok)
        }
        ControlRequest::StoreSize => ControlResponse::Size(store.len()),
        ControlRequest::ContainerInfo { id } => match store.lookup_by_id(&id) {
            Some(cntr) => ControlResponse::Container(ContainerSummary {
                id: cntr.id().to_string(),
                init_pid: cntr.init_pid().map(|p| p.as_raw()),
                netns_inode: cntr.net_ns_inode(),
                reg_completed: cntr.reg_completed(),
            }),
            None => ControlResponse::Error {
                kind: "not_found".to_string(),
                message: format!("container {id}"),
            },
        },
    }
}

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Binds the control socket, replacing a stale one from a previous run.
    pub fn bind(path: &Path) -> Result<ControlServer> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale control socket"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let listener = UnixListener::bind(path)?;
        Ok(ControlServer {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept loop; one short-lived thread per connection. Runs until the
    /// listener errors out.
    pub fn run(&self, store: Arc<ContainerStore>) -> Result<()> {
        tracing::info!(path = %self.path.display(), "control plane listening");
        for stream in self.listener.incoming() {
            let stream = stream?;
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                if let Err(err) = serve_connection(stream, &store) {
                    tracing::warn!("control connection failed: {err}");
                }
            });
        }
        Ok(())
    }
}

fn serve_connection(stream: UnixStream, store: &ContainerStore) -> Result<()> {
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => dispatch(store, request),
            Err(err) => ControlResponse::Error {
                kind: "invalid".to_string(),
                message: format!("bad control record: {err}"),
            },
        };
        let mut payload = serde_json::to_vec(&response)
            .map_err(|err| VkernError::Internal(format!("response encoding: {err}")))?;
        payload.push(b'\n');
        writer.write_all(&payload)?;
    }
    Ok(())
}
