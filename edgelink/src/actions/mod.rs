//! Cloud-invocable actions: registration, parameter schemas and requests.
//!
//! An action is a named remote procedure the cloud can invoke on the device.
//! Its handler is either an in-process callback or a subprocess command
//! template. Requests arrive through the mailbox, are dispatched by
//! [`dispatch::ActionDispatcher`] and acknowledged exactly once.

use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;

use crate::status::{AgentError, ErrorKind, Result};
use crate::value::{DataType, TypedValue};

pub mod dispatch;

/// Maximum length of an action name in UTF-8 bytes.
pub const ACTION_NAME_MAX: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterDirection {
    /// Supplied by the cloud, optional.
    In,
    /// Supplied by the cloud, mandatory.
    InRequired,
    /// Produced by the handler and returned in the acknowledgement.
    Out,
}

#[derive(Debug, Clone)]
pub struct ParameterSchema {
    pub name: String,
    pub direction: ParameterDirection,
    pub data_type: DataType,
}

/// Behavioral flags of an action.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionFlags {
    /// Subprocess targets are acknowledged as soon as the process is spawned.
    pub no_return: bool,
    /// Never runs concurrently with any other exclusive-device action.
    pub exclusive_device: bool,
    /// Never runs concurrently with another request for the same action.
    pub exclusive_app: bool,
}

/// Handler callback. Input parameters are read from the request; output
/// parameters are written back into it before the acknowledgement is built.
pub type ActionCallback = dyn Fn(&mut ActionRequest) -> Result<()> + Send + Sync;

pub enum ActionTarget {
    Callback(Box<ActionCallback>),
    /// Whitespace-separated command template. Input parameters are appended
    /// as `--name=value` tokens.
    Command(String),
}

impl std::fmt::Debug for ActionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionTarget::Callback(_) => f.write_str("Callback"),
            ActionTarget::Command(template) => write!(f, "Command({template:?})"),
        }
    }
}

#[derive(Debug)]
pub struct Action {
    pub name: String,
    pub parameters: Vec<ParameterSchema>,
    pub flags: ActionFlags,
    pub target: ActionTarget,
}

impl Action {
    pub fn callback<F>(name: impl Into<String>, handler: F) -> Action
    where
        F: Fn(&mut ActionRequest) -> Result<()> + Send + Sync + 'static,
    {
        Action {
            name: name.into(),
            parameters: Vec::new(),
            flags: ActionFlags::default(),
            target: ActionTarget::Callback(Box::new(handler)),
        }
    }

    pub fn command(name: impl Into<String>, template: impl Into<String>) -> Action {
        Action {
            name: name.into(),
            parameters: Vec::new(),
            flags: ActionFlags::default(),
            target: ActionTarget::Command(template.into()),
        }
    }

    pub fn with_parameter(
        mut self,
        name: impl Into<String>,
        direction: ParameterDirection,
        data_type: DataType,
    ) -> Action {
        self.parameters.push(ParameterSchema {
            name: name.into(),
            direction,
            data_type,
        });
        self
    }

    pub fn with_flags(mut self, flags: ActionFlags) -> Action {
        self.flags = flags;
        self
    }
}

/// A cloud-originated invocation of one action.
#[derive(Debug)]
pub struct ActionRequest {
    pub name: String,
    /// Cloud-assigned id echoed back in the acknowledgement.
    pub request_id: String,
    /// Protocol tag of the plug-in that decoded the request.
    pub source: String,
    pub params: IndexMap<String, TypedValue>,
    pub out_params: IndexMap<String, TypedValue>,
}

impl ActionRequest {
    pub fn new(
        name: impl Into<String>,
        request_id: impl Into<String>,
        source: impl Into<String>,
        params: IndexMap<String, TypedValue>,
    ) -> ActionRequest {
        ActionRequest {
            name: name.into(),
            request_id: request_id.into(),
            source: source.into(),
            params,
            out_params: IndexMap::new(),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&TypedValue> {
        self.params.get(name)
    }

    /// Fetches a parameter converted to `target`, widening if necessary.
    pub fn parameter_as(&self, name: &str, target: DataType) -> Result<TypedValue> {
        let value = self.params.get(name).ok_or_else(|| {
            AgentError::new(ErrorKind::NotFound, format!("no parameter named {name:?}"))
        })?;
        value.convert_to(target)
    }

    pub fn set_out_parameter(&mut self, name: impl Into<String>, value: TypedValue) {
        self.out_params.insert(name.into(), value);
    }
}

/// A request together with its dispatch result, ready to be acknowledged.
#[derive(Debug)]
pub struct CompletedRequest {
    pub request: ActionRequest,
    pub result: Result<()>,
}

struct ActionEntry {
    action: Action,
    /// Serializes requests for this action when `exclusive_app` is set.
    app_lock: Mutex<()>,
}

/// Mapping from action name to action record. Names are unique and iteration
/// follows registration order.
pub struct ActionRegistry {
    entries: Mutex<IndexMap<String, Arc<ActionEntry>>>,
}

impl ActionRegistry {
    pub fn new() -> ActionRegistry {
        ActionRegistry {
            entries: Mutex::new(IndexMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, Arc<ActionEntry>>> {
        self.entries.lock().expect("action registry mutex poisoned")
    }

    pub fn register(&self, action: Action) -> Result<()> {
        if action.name.is_empty() || action.name.len() > ACTION_NAME_MAX {
            return Err(AgentError::new(
                ErrorKind::BadParameter,
                format!("action name must be 1..={ACTION_NAME_MAX} bytes"),
            ));
        }
        let mut entries = self.lock();
        if entries.contains_key(&action.name) {
            return Err(AgentError::new(
                ErrorKind::BadRequest,
                format!("action {:?} is already registered", action.name),
            ));
        }
        log::debug!("registering action {:?}", action.name);
        entries.insert(
            action.name.clone(),
            Arc::new(ActionEntry {
                action,
                app_lock: Mutex::new(()),
            }),
        );
        Ok(())
    }

    pub fn deregister(&self, name: &str) -> Result<()> {
        let mut entries = self.lock();
        entries.shift_remove(name).ok_or_else(|| {
            AgentError::new(ErrorKind::NotFound, format!("no action named {name:?}"))
        })?;
        log::debug!("deregistered action {name:?}");
        Ok(())
    }

    pub fn deregister_all(&self) {
        self.lock().clear();
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn get(&self, name: &str) -> Option<Arc<ActionEntry>> {
        self.lock().get(name).cloned()
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        ActionRegistry::new()
    }
}
