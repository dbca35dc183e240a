// In-memory backend for pipeline tests.

use crate::backend::{ExecutionBackend, InstanceConfig, InstanceHandle, InstanceStatus, RawExecution};
use crate::error::BackendError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use testbox_common::types::Environment;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Exists(String),
    Status(String),
    Create(String),
    Start(String),
    Stop(String),
    Delete(String),
    PutFile(String, String),
    Execute {
        instance: String,
        argv: Vec<String>,
        env: Environment,
    },
}

#[derive(Debug, Default)]
struct MockInstance {
    running: bool,
    files: BTreeMap<String, Vec<u8>>,
}

type Responder = Box<dyn Fn(&str, &[String], &Environment) -> RawExecution + Send + Sync>;

pub fn ok_output(stdout: &str) -> RawExecution {
    RawExecution {
        exit_code: Some(0),
        stdout: Some(stdout.as_bytes().to_vec()),
        stderr: Some(Vec::new()),
    }
}

pub fn exit_output(code: i64, stderr: &str) -> RawExecution {
    RawExecution {
        exit_code: Some(code),
        stdout: Some(Vec::new()),
        stderr: Some(stderr.as_bytes().to_vec()),
    }
}

pub struct MockBackend {
    instances: Mutex<HashMap<String, MockInstance>>,
    calls: Mutex<Vec<Call>>,
    responder: Responder,
    /// (instance, program) pairs whose execute call errors
    failing: Mutex<HashSet<(String, String)>>,
    panicking: Mutex<HashSet<String>>,
    failing_stop: Mutex<HashSet<String>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_responder(|_, _, _| ok_output(""))
    }

    pub fn with_responder(
        responder: impl Fn(&str, &[String], &Environment) -> RawExecution + Send + Sync + 'static,
    ) -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
            failing: Mutex::new(HashSet::new()),
            panicking: Mutex::new(HashSet::new()),
            failing_stop: Mutex::new(HashSet::new()),
        }
    }

    /// Seed an instance that already exists.
    pub fn add_instance(&self, name: &str, running: bool) {
        self.instances.lock().unwrap().insert(
            name.to_string(),
            MockInstance {
                running,
                files: BTreeMap::new(),
            },
        );
    }

    /// Make `execute` of `program` on `instance` return an error.
    pub fn fail_execute(&self, instance: &str, program: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert((instance.to_string(), program.to_string()));
    }

    /// Make any `execute` on `instance` panic.
    pub fn panic_on_execute(&self, instance: &str) {
        self.panicking.lock().unwrap().insert(instance.to_string());
    }

    /// Make `stop` of `instance` return an error.
    pub fn fail_stop(&self, instance: &str) {
        self.failing_stop.lock().unwrap().insert(instance.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, instance: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| call_instance(call) == instance)
            .collect()
    }

    pub fn file(&self, instance: &str, path: &str) -> Option<Vec<u8>> {
        self.instances
            .lock()
            .unwrap()
            .get(instance)
            .and_then(|i| i.files.get(path).cloned())
    }

    pub fn is_running(&self, instance: &str) -> bool {
        self.instances
            .lock()
            .unwrap()
            .get(instance)
            .map(|i| i.running)
            .unwrap_or(false)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn with_instance<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut MockInstance) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances
            .get_mut(name)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        f(instance)
    }
}

pub fn call_instance(call: &Call) -> &str {
    match call {
        Call::Exists(name)
        | Call::Status(name)
        | Call::Create(name)
        | Call::Start(name)
        | Call::Stop(name)
        | Call::Delete(name)
        | Call::PutFile(name, _) => name,
        Call::Execute { instance, .. } => instance,
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    async fn exists(&self, name: &str) -> Result<bool, BackendError> {
        self.record(Call::Exists(name.to_string()));
        Ok(self.instances.lock().unwrap().contains_key(name))
    }

    async fn status(&self, name: &str) -> Result<InstanceStatus, BackendError> {
        self.record(Call::Status(name.to_string()));
        self.with_instance(name, |i| {
            Ok(if i.running {
                InstanceStatus::Running
            } else {
                InstanceStatus::Stopped
            })
        })
    }

    async fn create(&self, config: &InstanceConfig) -> Result<InstanceHandle, BackendError> {
        self.record(Call::Create(config.name.clone()));
        let mut instances = self.instances.lock().unwrap();
        if instances.contains_key(&config.name) {
            return Err(BackendError::Other(format!("{} already exists", config.name)));
        }
        instances.insert(config.name.clone(), MockInstance::default());
        Ok(InstanceHandle::new(config.name.clone()))
    }

    async fn start(&self, handle: &InstanceHandle) -> Result<(), BackendError> {
        self.record(Call::Start(handle.name.clone()));
        self.with_instance(&handle.name, |i| {
            i.running = true;
            Ok(())
        })
    }

    async fn stop(&self, handle: &InstanceHandle) -> Result<(), BackendError> {
        self.record(Call::Stop(handle.name.clone()));
        if self.failing_stop.lock().unwrap().contains(&handle.name) {
            return Err(BackendError::Other(format!("injected failure stopping {}", handle.name)));
        }
        self.with_instance(&handle.name, |i| {
            i.running = false;
            Ok(())
        })
    }

    async fn delete(&self, handle: &InstanceHandle) -> Result<(), BackendError> {
        self.record(Call::Delete(handle.name.clone()));
        self.instances
            .lock()
            .unwrap()
            .remove(&handle.name)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(handle.name.clone()))
    }

    async fn put_file(
        &self,
        handle: &InstanceHandle,
        remote_path: &str,
        contents: &[u8],
    ) -> Result<(), BackendError> {
        self.record(Call::PutFile(handle.name.clone(), remote_path.to_string()));
        self.with_instance(&handle.name, |i| {
            i.files.insert(remote_path.to_string(), contents.to_vec());
            Ok(())
        })
    }

    async fn execute(
        &self,
        handle: &InstanceHandle,
        argv: &[String],
        env: &Environment,
    ) -> Result<RawExecution, BackendError> {
        self.record(Call::Execute {
            instance: handle.name.clone(),
            argv: argv.to_vec(),
            env: env.clone(),
        });

        let should_panic = self.panicking.lock().unwrap().contains(&handle.name);
        if should_panic {
            panic!("mock execute panicked on {}", handle.name);
        }

        let program = argv.first().cloned().unwrap_or_default();
        let should_fail = self
            .failing
            .lock()
            .unwrap()
            .contains(&(handle.name.clone(), program.clone()));
        if should_fail {
            return Err(BackendError::Other(format!("injected failure running {}", program)));
        }

        let has_target = self.with_instance(&handle.name, |i| {
            if !i.running {
                return Err(BackendError::Other(format!("{} is not running", handle.name)));
            }
            Ok(argv.last().map(|p| i.files.contains_key(p)).unwrap_or(false))
        })?;

        if program == "chmod" {
            return Ok(if has_target {
                ok_output("")
            } else {
                exit_output(1, "chmod: cannot access file")
            });
        }

        Ok((self.responder)(&handle.name, argv, env))
    }
}
