//! Telemetry, attribute and location publishing.
//!
//! Values are validated against their registration, stamped, and enqueued as
//! typed samples. The agent scheduler drains the queue, serializes each
//! sample through the protocol codec and publishes it at the configured QoS.
//! Nothing here retries; a failed publish is reported to the caller.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tokio::sync::mpsc::UnboundedSender;

use crate::status::{AgentError, ErrorKind, Result};
use crate::transport::QosLevel;
use crate::value::{DataType, TypedValue};

/// Registration lifecycle of a telemetry or attribute name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Deregistered,
    DeregisterPending,
    Registered,
    RegisterPending,
}

/// Per-publish options. The timestamp defaults to the time of the call and
/// the QoS to at-least-once.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub qos: Option<QosLevel>,
    pub ts: Option<DateTime<Utc>>,
}

/// One sample on its way to the cloud.
#[derive(Debug, Clone)]
pub struct Sample {
    pub key: String,
    pub value: TypedValue,
    pub ts: DateTime<Utc>,
    pub qos: QosLevel,
}

#[derive(Debug)]
struct TelemetryRecord {
    data_type: DataType,
    state: RegistrationState,
    last_publish: Option<DateTime<Utc>>,
}

/// Registry of telemetry and attribute names with their declared types.
pub struct TelemetryRegistry {
    entries: std::sync::Mutex<IndexMap<String, TelemetryRecord>>,
    samples: UnboundedSender<Sample>,
    /// When set, the caller-provided QoS is overridden with at-least-once,
    /// matching the cloud side's delivery expectations.
    force_qos1: bool,
}

impl TelemetryRegistry {
    pub fn new(samples: UnboundedSender<Sample>, force_qos1: bool) -> TelemetryRegistry {
        TelemetryRegistry {
            entries: std::sync::Mutex::new(IndexMap::new()),
            samples,
            force_qos1,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexMap<String, TelemetryRecord>> {
        self.entries.lock().expect("telemetry registry mutex poisoned")
    }

    pub fn register(&self, name: impl Into<String>, data_type: DataType) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(AgentError::new(ErrorKind::BadParameter, "empty telemetry name"));
        }
        let mut entries = self.lock();
        if entries.contains_key(&name) {
            return Err(AgentError::new(
                ErrorKind::BadRequest,
                format!("telemetry {name:?} is already registered"),
            ));
        }
        entries.insert(
            name,
            TelemetryRecord {
                data_type,
                state: RegistrationState::RegisterPending,
                last_publish: None,
            },
        );
        Ok(())
    }

    pub fn deregister(&self, name: &str) -> Result<()> {
        let mut entries = self.lock();
        let record = entries.get_mut(name).ok_or_else(|| {
            AgentError::new(ErrorKind::NotFound, format!("no telemetry named {name:?}"))
        })?;
        record.state = RegistrationState::DeregisterPending;
        Ok(())
    }

    /// Completes pending registrations and removes pending deregistrations.
    /// Called by the scheduler once a session is available.
    pub fn commit(&self) {
        let mut entries = self.lock();
        entries.retain(|name, record| match record.state {
            RegistrationState::RegisterPending => {
                log::debug!("telemetry {name:?} is now registered");
                record.state = RegistrationState::Registered;
                true
            }
            RegistrationState::DeregisterPending => {
                log::debug!("telemetry {name:?} deregistered");
                false
            }
            RegistrationState::Registered => true,
            RegistrationState::Deregistered => false,
        });
    }

    pub fn state(&self, name: &str) -> Option<RegistrationState> {
        self.lock().get(name).map(|record| record.state)
    }

    /// Validates and enqueues one sample.
    pub fn publish(
        &self,
        name: &str,
        value: TypedValue,
        options: &PublishOptions,
    ) -> Result<()> {
        let mut entries = self.lock();
        let record = entries.get_mut(name).ok_or_else(|| {
            AgentError::new(ErrorKind::NotFound, format!("no telemetry named {name:?}"))
        })?;
        if record.state != RegistrationState::Registered {
            return Err(AgentError::new(
                ErrorKind::NotInitialized,
                format!("telemetry {name:?} is not registered"),
            ));
        }

        let value = value.convert_to(record.data_type)?;
        let ts = options.ts.unwrap_or_else(Utc::now);
        let qos = if self.force_qos1 {
            QosLevel::AtLeastOnce
        } else {
            options.qos.unwrap_or(QosLevel::AtLeastOnce)
        };
        record.last_publish = Some(ts);
        drop(entries);

        self.samples
            .send(Sample {
                key: name.to_string(),
                value,
                ts,
                qos,
            })
            .map_err(|_| AgentError::new(ErrorKind::NotInitialized, "agent is shut down"))
    }
}

#[cfg(test)]
mod test {
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;

    fn make_registry(
        force_qos1: bool,
    ) -> (TelemetryRegistry, tokio::sync::mpsc::UnboundedReceiver<Sample>) {
        let (tx, rx) = unbounded_channel();
        (TelemetryRegistry::new(tx, force_qos1), rx)
    }

    #[test]
    fn publish_requires_registered_state() {
        let (registry, _rx) = make_registry(true);
        registry.register("temp", DataType::F64).unwrap();
        assert_eq!(
            registry.state("temp"),
            Some(RegistrationState::RegisterPending)
        );

        let err = registry
            .publish("temp", TypedValue::F64(1.0), &PublishOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);

        registry.commit();
        assert_eq!(registry.state("temp"), Some(RegistrationState::Registered));
        registry
            .publish("temp", TypedValue::F64(1.0), &PublishOptions::default())
            .unwrap();
    }

    #[test]
    fn publish_validates_value_type() {
        let (registry, mut rx) = make_registry(true);
        registry.register("count", DataType::I64).unwrap();
        registry.commit();

        registry
            .publish("count", TypedValue::I16(7), &PublishOptions::default())
            .unwrap();
        let sample = rx.try_recv().unwrap();
        assert_eq!(sample.value, TypedValue::I64(7));

        let err = registry
            .publish(
                "count",
                TypedValue::String("seven".into()),
                &PublishOptions::default(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadParameter);
    }

    #[test]
    fn forced_qos_overrides_caller_value() {
        let (registry, mut rx) = make_registry(true);
        registry.register("t", DataType::Bool).unwrap();
        registry.commit();

        let options = PublishOptions {
            qos: Some(QosLevel::AtMostOnce),
            ts: None,
        };
        registry.publish("t", TypedValue::Bool(true), &options).unwrap();
        assert_eq!(rx.try_recv().unwrap().qos, QosLevel::AtLeastOnce);

        let (registry, mut rx) = make_registry(false);
        registry.register("t", DataType::Bool).unwrap();
        registry.commit();
        registry.publish("t", TypedValue::Bool(true), &options).unwrap();
        assert_eq!(rx.try_recv().unwrap().qos, QosLevel::AtMostOnce);
    }

    #[test]
    fn caller_timestamp_is_preserved() {
        use chrono::TimeZone;

        let (registry, mut rx) = make_registry(true);
        registry.register("t", DataType::I32).unwrap();
        registry.commit();

        let ts = Utc.with_ymd_and_hms(2023, 9, 1, 12, 0, 0).unwrap();
        registry
            .publish(
                "t",
                TypedValue::I32(1),
                &PublishOptions {
                    qos: None,
                    ts: Some(ts),
                },
            )
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().ts, ts);
    }

    #[test]
    fn deregistered_name_is_removed_on_commit() {
        let (registry, _rx) = make_registry(true);
        registry.register("gone", DataType::I32).unwrap();
        registry.commit();
        registry.deregister("gone").unwrap();
        registry.commit();
        assert_eq!(registry.state("gone"), None);
    }
}
