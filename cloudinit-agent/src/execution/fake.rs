//! Recording `CommandRunner` that simulates the hostname commands in memory

use super::{CommandError, CommandRunner, CommandSpec, ExecutionResult};
use async_trait::async_trait;
use std::sync::Mutex;

pub(crate) struct FakeRunner {
    hostname: Mutex<String>,
    calls: Mutex<Vec<CommandSpec>>,
    failing: Mutex<Vec<String>>,
    /// Renames succeed but `hostname` keeps printing the old name
    rename_on_reboot: bool,
}

impl FakeRunner {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: Mutex::new(hostname.to_string()),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(Vec::new()),
            rename_on_reboot: false,
        }
    }

    pub fn rename_on_reboot(mut self) -> Self {
        self.rename_on_reboot = true;
        self
    }

    /// Any command whose full line contains `needle` exits with status 1
    pub fn fail_on(self, needle: &str) -> Self {
        self.failing.lock().unwrap().push(needle.to_string());
        self
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn hostname(&self) -> String {
        self.hostname.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded commands whose unredacted line contains `needle`
    pub fn count(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|spec| full_line(spec).contains(needle))
            .count()
    }

    fn simulate(&self, tokens: &[&str]) -> String {
        let mut hostname = self.hostname.lock().unwrap();
        if let ["hostname"] = tokens {
            return format!("{}\n", hostname);
        }
        if self.rename_on_reboot {
            return String::new();
        }
        match tokens {
            ["hostname", new_name] | ["hostnamectl", "set-hostname", new_name] => {
                *hostname = new_name.to_string();
            }
            ["cmd", "/C", "wmic", .., "rename", new_name] => *hostname = new_name.to_string(),
            _ => {
                if let Some(idx) = tokens.iter().position(|t| *t == "-NewName") {
                    if let Some(new_name) = tokens.get(idx + 1) {
                        *hostname = new_name.to_string();
                    }
                }
            }
        }
        String::new()
    }
}

fn full_line(spec: &CommandSpec) -> String {
    let mut line = spec.program.clone();
    for arg in &spec.args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecutionResult, CommandError> {
        self.calls.lock().unwrap().push(spec.clone());

        let line = full_line(spec);
        let fails = self
            .failing
            .lock()
            .unwrap()
            .iter()
            .any(|needle| line.contains(needle.as_str()));
        if fails {
            return Ok(ExecutionResult {
                success: false,
                stderr: "simulated failure".to_string(),
                exit_code: Some(1),
                ..ExecutionResult::default()
            });
        }

        let mut tokens: Vec<&str> = std::iter::once(spec.program.as_str())
            .chain(spec.args.iter().map(String::as_str))
            .collect();
        if tokens.first() == Some(&"sudo") {
            tokens.remove(0);
        }

        Ok(ExecutionResult {
            success: true,
            stdout: self.simulate(&tokens),
            exit_code: Some(0),
            ..ExecutionResult::default()
        })
    }
}
