//! Action dispatch worker.
//!
//! Requests decoded from the mailbox are queued into a bounded channel and
//! drained by one dedicated thread. Handlers are allowed to block there;
//! nothing is ever invoked on the transport receive path. Every accepted
//! request produces exactly one completion, whatever the outcome.

use std::fs::File;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc::UnboundedSender;

use crate::status::{AgentError, ErrorKind, Result};
use crate::utils;
use crate::value::TypedValue;

use super::{
    ActionRegistry, ActionRequest, ActionTarget, CompletedRequest, ParameterDirection,
};

/// Bound of the inbound request queue.
const REQUEST_QUEUE_BOUND: usize = 50;

/// A request the dispatcher could not accept, together with the reason.
#[derive(Debug)]
pub struct RejectedRequest {
    pub request: ActionRequest,
    pub error: AgentError,
}

pub struct ActionDispatcher {
    sender: Option<mpsc::SyncSender<ActionRequest>>,
    thread: Option<JoinHandle<()>>,
}

impl ActionDispatcher {
    /// Starts the dispatch worker. Completions are pushed into `completions`
    /// for the scheduler to acknowledge. Subprocess output is captured under
    /// `log_dir`.
    pub fn new(
        registry: Arc<ActionRegistry>,
        completions: UnboundedSender<CompletedRequest>,
        log_dir: PathBuf,
    ) -> ActionDispatcher {
        let (sender, receiver) = mpsc::sync_channel::<ActionRequest>(REQUEST_QUEUE_BOUND);
        // Serializes every action carrying the exclusive-device flag.
        let device_lock = Arc::new(Mutex::new(()));

        log::debug!("starting action dispatch thread");
        let thread = thread::spawn(move || {
            while let Ok(mut request) = receiver.recv() {
                log::debug!(
                    "dispatching action {:?} (request {})",
                    request.name,
                    request.request_id
                );
                let result = dispatch_one(&registry, &device_lock, &log_dir, &mut request);
                if let Err(e) = &result {
                    log::warn!(
                        "action {:?} (request {}) failed: {}",
                        request.name,
                        request.request_id,
                        e
                    );
                }
                if completions
                    .send(CompletedRequest { request, result })
                    .is_err()
                {
                    // The agent is gone; completions can no longer be acked.
                    log::debug!("completion channel closed, dispatcher stopping");
                    return;
                }
            }
            log::debug!("action dispatch thread is stopping");
        });

        ActionDispatcher {
            sender: Some(sender),
            thread: Some(thread),
        }
    }

    /// Queues a request for execution. A rejected request is handed back to
    /// the caller together with the reason so it can still be acknowledged;
    /// nothing is dropped silently.
    pub fn submit(&self, request: ActionRequest) -> std::result::Result<(), RejectedRequest> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(RejectedRequest {
                request,
                error: AgentError::new(ErrorKind::NotInitialized, "dispatcher stopped"),
            });
        };
        match sender.try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(request)) => Err(RejectedRequest {
                request,
                error: AgentError::new(ErrorKind::Full, "request queue is full"),
            }),
            Err(TrySendError::Disconnected(request)) => Err(RejectedRequest {
                request,
                error: AgentError::new(ErrorKind::NotInitialized, "dispatcher thread has exited"),
            }),
        }
    }
}

impl Drop for ActionDispatcher {
    fn drop(&mut self) {
        // Dropping the sender lets the thread drain what it accepted and exit.
        drop(self.sender.take());
        utils::thread::join(&mut self.thread);
    }
}

fn dispatch_one(
    registry: &ActionRegistry,
    device_lock: &Mutex<()>,
    log_dir: &Path,
    request: &mut ActionRequest,
) -> Result<()> {
    let entry = registry.get(&request.name).ok_or_else(|| {
        AgentError::new(
            ErrorKind::NotFound,
            format!("no action named {:?}", request.name),
        )
    })?;

    validate_parameters(&entry.action.parameters, request)?;

    let _device_guard = entry
        .action
        .flags
        .exclusive_device
        .then(|| device_lock.lock().expect("device exclusivity mutex poisoned"));
    let _app_guard = entry
        .action
        .flags
        .exclusive_app
        .then(|| entry.app_lock.lock().expect("action exclusivity mutex poisoned"));

    match &entry.action.target {
        ActionTarget::Callback(handler) => {
            match catch_unwind(AssertUnwindSafe(|| handler(request))) {
                Ok(result) => result,
                Err(cause) => {
                    let text = cause
                        .downcast_ref::<&'static str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| cause.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "handler panicked".to_string());
                    log::error!("action {:?} handler panicked: {text}", request.name);
                    Err(AgentError::new(ErrorKind::ExecutionError, text))
                }
            }
        }
        ActionTarget::Command(template) => {
            run_command(template, entry.action.flags.no_return, log_dir, request)
        }
    }
}

fn validate_parameters(
    schema: &[super::ParameterSchema],
    request: &mut ActionRequest,
) -> Result<()> {
    for parameter in schema {
        match parameter.direction {
            ParameterDirection::Out => continue,
            ParameterDirection::In | ParameterDirection::InRequired => {}
        }
        match request.params.get(&parameter.name) {
            Some(value) => {
                let converted = value.convert_to(parameter.data_type).map_err(|_| {
                    AgentError::new(
                        ErrorKind::BadParameter,
                        format!(
                            "parameter {:?} has type {:?}, expected {:?}",
                            parameter.name,
                            value.data_type(),
                            parameter.data_type
                        ),
                    )
                })?;
                request.params.insert(parameter.name.clone(), converted);
            }
            None if parameter.direction == ParameterDirection::InRequired => {
                return Err(AgentError::new(
                    ErrorKind::BadParameter,
                    format!("required parameter {:?} is missing", parameter.name),
                ));
            }
            None => {}
        }
    }
    Ok(())
}

fn run_command(
    template: &str,
    no_return: bool,
    log_dir: &Path,
    request: &ActionRequest,
) -> Result<()> {
    let mut tokens = template.split_whitespace();
    let program = tokens.next().ok_or_else(|| {
        AgentError::new(ErrorKind::BadParameter, "empty command template")
    })?;

    let mut command = Command::new(program);
    command.args(tokens);
    for (name, value) in &request.params {
        command.arg(format!("--{name}={}", argv_token(value)));
    }

    let stdout = File::create(log_dir.join(format!("{}-stdout.log", request.name)))?;
    let stderr = File::create(log_dir.join(format!("{}-stderr.log", request.name)))?;
    command
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    log::info!("executing {program:?} for action {:?}", request.name);
    let mut child = command
        .spawn()
        .map_err(|e| AgentError::new(ErrorKind::ExecutionError, format!("{program}: {e}")))?;

    if no_return {
        // The process keeps running detached; success means it was spawned.
        return Ok(());
    }

    let status = child
        .wait()
        .map_err(|e| AgentError::new(ErrorKind::ExecutionError, e.to_string()))?;
    if status.success() {
        Ok(())
    } else {
        Err(AgentError::new(
            ErrorKind::ExecutionError,
            match status.code() {
                Some(code) => format!("{program} exited with code {code}"),
                None => format!("{program} terminated by signal"),
            },
        ))
    }
}

fn argv_token(value: &TypedValue) -> String {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    match value {
        TypedValue::Bool(v) => v.to_string(),
        TypedValue::I8(v) => v.to_string(),
        TypedValue::I16(v) => v.to_string(),
        TypedValue::I32(v) => v.to_string(),
        TypedValue::I64(v) => v.to_string(),
        TypedValue::U8(v) => v.to_string(),
        TypedValue::U16(v) => v.to_string(),
        TypedValue::U32(v) => v.to_string(),
        TypedValue::U64(v) => v.to_string(),
        TypedValue::F32(v) => v.to_string(),
        TypedValue::F64(v) => v.to_string(),
        TypedValue::String(v) => v.clone(),
        TypedValue::Raw(bytes) => BASE64.encode(bytes),
        TypedValue::Location(location) => {
            format!("{},{}", location.latitude, location.longitude)
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use indexmap::IndexMap;
    use tokio::sync::mpsc::unbounded_channel;

    use crate::actions::{Action, ActionFlags};
    use crate::value::DataType;

    use super::*;

    fn request(name: &str, id: &str, params: IndexMap<String, TypedValue>) -> ActionRequest {
        ActionRequest::new(name, id, "tr50", params)
    }

    fn recv_completion(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<CompletedRequest>,
    ) -> CompletedRequest {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(completed) = rx.try_recv() {
                return completed;
            }
            assert!(Instant::now() < deadline, "no completion within deadline");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn unknown_action_completes_with_not_found() {
        let registry = Arc::new(ActionRegistry::new());
        let (tx, mut rx) = unbounded_channel();
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ActionDispatcher::new(registry, tx, dir.path().to_path_buf());

        dispatcher
            .submit(request("ghost", "r1", IndexMap::new()))
            .unwrap();

        let completed = recv_completion(&mut rx);
        assert_eq!(completed.request.request_id, "r1");
        assert_eq!(completed.result.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn callback_receives_widened_parameters_and_returns_outputs() {
        let registry = Arc::new(ActionRegistry::new());
        registry
            .register(
                Action::callback("scale", |req| {
                    let TypedValue::I64(rate) = req.parameter("rate").unwrap() else {
                        panic!("rate must arrive widened to i64");
                    };
                    req.set_out_parameter("doubled", TypedValue::I64(rate * 2));
                    Ok(())
                })
                .with_parameter("rate", ParameterDirection::InRequired, DataType::I64),
            )
            .unwrap();

        let (tx, mut rx) = unbounded_channel();
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ActionDispatcher::new(registry, tx, dir.path().to_path_buf());

        let mut params = IndexMap::new();
        params.insert("rate".to_string(), TypedValue::I32(21));
        dispatcher.submit(request("scale", "r2", params)).unwrap();

        let completed = recv_completion(&mut rx);
        assert!(completed.result.is_ok());
        assert_eq!(
            completed.request.out_params["doubled"],
            TypedValue::I64(42)
        );
    }

    #[test]
    fn missing_required_parameter_is_bad_parameter() {
        let registry = Arc::new(ActionRegistry::new());
        registry
            .register(
                Action::callback("needs", |_| Ok(()))
                    .with_parameter("must", ParameterDirection::InRequired, DataType::String),
            )
            .unwrap();

        let (tx, mut rx) = unbounded_channel();
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ActionDispatcher::new(registry, tx, dir.path().to_path_buf());

        dispatcher
            .submit(request("needs", "r3", IndexMap::new()))
            .unwrap();
        let completed = recv_completion(&mut rx);
        assert_eq!(
            completed.result.unwrap_err().kind(),
            ErrorKind::BadParameter
        );
    }

    #[test]
    fn narrowing_out_of_range_is_bad_parameter() {
        let registry = Arc::new(ActionRegistry::new());
        registry
            .register(
                Action::callback("tiny", |_| Ok(()))
                    .with_parameter("v", ParameterDirection::In, DataType::I8),
            )
            .unwrap();

        let (tx, mut rx) = unbounded_channel();
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ActionDispatcher::new(registry, tx, dir.path().to_path_buf());

        let mut params = IndexMap::new();
        params.insert("v".to_string(), TypedValue::I64(1000));
        dispatcher.submit(request("tiny", "r4", params)).unwrap();

        let completed = recv_completion(&mut rx);
        assert_eq!(
            completed.result.unwrap_err().kind(),
            ErrorKind::BadParameter
        );
    }

    #[test]
    fn panicking_handler_reports_execution_error() {
        let registry = Arc::new(ActionRegistry::new());
        registry
            .register(Action::callback("boom", |_| panic!("kaput")))
            .unwrap();

        let (tx, mut rx) = unbounded_channel();
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ActionDispatcher::new(registry, tx, dir.path().to_path_buf());

        dispatcher
            .submit(request("boom", "r5", IndexMap::new()))
            .unwrap();
        let completed = recv_completion(&mut rx);
        let err = completed.result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutionError);
        assert_eq!(err.message(), Some("kaput"));
    }

    #[test]
    fn exclusive_device_actions_never_overlap() {
        let registry = Arc::new(ActionRegistry::new());
        let spans: Arc<Mutex<Vec<(String, Instant, Instant)>>> =
            Arc::new(Mutex::new(Vec::new()));

        for name in ["slow_a", "slow_b"] {
            let spans = spans.clone();
            registry
                .register(
                    Action::callback(name, move |req| {
                        let start = Instant::now();
                        std::thread::sleep(Duration::from_millis(50));
                        spans.lock().unwrap().push((
                            req.name.clone(),
                            start,
                            Instant::now(),
                        ));
                        Ok(())
                    })
                    .with_flags(ActionFlags {
                        exclusive_device: true,
                        ..ActionFlags::default()
                    }),
                )
                .unwrap();
        }

        let (tx, mut rx) = unbounded_channel();
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ActionDispatcher::new(registry, tx, dir.path().to_path_buf());

        dispatcher
            .submit(request("slow_a", "r6", IndexMap::new()))
            .unwrap();
        dispatcher
            .submit(request("slow_b", "r7", IndexMap::new()))
            .unwrap();

        let first = recv_completion(&mut rx);
        let second = recv_completion(&mut rx);
        assert_eq!(first.request.request_id, "r6");
        assert_eq!(second.request.request_id, "r7");

        let spans = spans.lock().unwrap();
        assert_eq!(spans.len(), 2);
        let (_, _, a_end) = &spans[0];
        let (_, b_start, _) = &spans[1];
        assert!(a_end <= b_start, "handler bodies overlapped in time");
    }

    #[cfg(unix)]
    #[test]
    fn command_target_captures_output_and_exit_code() {
        let registry = Arc::new(ActionRegistry::new());
        registry
            .register(Action::command("say", "sh -c echo"))
            .unwrap();
        registry
            .register(Action::command("fail", "sh -c exit_1_does_not_exist"))
            .unwrap();

        let (tx, mut rx) = unbounded_channel();
        let dir = tempfile::tempdir().unwrap();
        let dispatcher =
            ActionDispatcher::new(registry, tx, dir.path().to_path_buf());

        dispatcher
            .submit(request("say", "r8", IndexMap::new()))
            .unwrap();
        let completed = recv_completion(&mut rx);
        assert!(completed.result.is_ok());
        assert!(dir.path().join("say-stdout.log").exists());
        assert!(dir.path().join("say-stderr.log").exists());

        dispatcher
            .submit(request("fail", "r9", IndexMap::new()))
            .unwrap();
        let completed = recv_completion(&mut rx);
        assert_eq!(
            completed.result.unwrap_err().kind(),
            ErrorKind::ExecutionError
        );
    }

    #[cfg(unix)]
    #[test]
    fn no_return_command_is_acknowledged_after_spawn() {
        let registry = Arc::new(ActionRegistry::new());
        registry
            .register(
                Action::command("linger", "sleep 5").with_flags(ActionFlags {
                    no_return: true,
                    ..ActionFlags::default()
                }),
            )
            .unwrap();

        let (tx, mut rx) = unbounded_channel();
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ActionDispatcher::new(registry, tx, dir.path().to_path_buf());

        let started = Instant::now();
        dispatcher
            .submit(request("linger", "r10", IndexMap::new()))
            .unwrap();
        let completed = recv_completion(&mut rx);
        assert!(completed.result.is_ok());
        assert!(
            started.elapsed() < Duration::from_secs(4),
            "acknowledgement waited for the detached process"
        );
    }
}
