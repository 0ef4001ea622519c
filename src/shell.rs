//! Nodes implemented by an external program.
//!
//! The input message goes to the program's stdin as one JSON line. Each
//! line the program prints is one emitted item: a JSON array is a tuple,
//! any other JSON value a scalar. Anything on stderr fails the node.

use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::process::{ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::message::Message;
use crate::node::{Item, NodeError, NodeFn, Output};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellNode {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl ShellNode {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    /// Split a whitespace-separated command line. No quoting is supported.
    pub fn parse(command: &str) -> Result<Self, NodeError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| NodeError::InvalidInput("empty command".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            cwd: None,
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Run the program once for `message` and collect what it printed.
    pub fn run(&self, message: &Message) -> Result<Vec<Item>, NodeError> {
        let line = message.to_json_line()?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            NodeError::ExecutionFailed(format!("could not start \"{}\": {}", self.program, e))
        })?;

        // stdin is fed from its own thread while stdout and stderr drain here
        let stdin = child.stdin.take();
        let (output, written) = thread::scope(|scope| {
            let writer = scope.spawn(move || feed(stdin, line.as_bytes()));
            (child.wait_with_output(), writer.join())
        });
        let output = output?;
        written.map_err(|_| {
            NodeError::Internal(format!("stdin writer for \"{}\" panicked", self.program))
        })??;

        if !output.stderr.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("error calling \"{}\": {}", self.program, stderr);
            return Err(NodeError::ExecutionFailed(stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let items = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(deserialize)
            .collect::<Result<Vec<_>, _>>()?;
        debug!("\"{}\" returned {} messages", self.program, items.len());
        Ok(items)
    }

    /// The node body for registration.
    pub fn into_node_fn(self) -> NodeFn {
        Arc::new(move |message: &Message| -> Result<Output, NodeError> {
            let items = self.run(message)?;
            Ok(Output::try_yielding(items.into_iter().map(Ok)))
        })
    }
}

/// A program that never reads its input closes the pipe early; that is not
/// an error.
fn feed(stdin: Option<ChildStdin>, bytes: &[u8]) -> std::io::Result<()> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };
    match stdin.write_all(bytes) {
        Err(e) if e.kind() != ErrorKind::BrokenPipe => Err(e),
        _ => Ok(()),
    }
}

fn deserialize(line: &str) -> Result<Item, NodeError> {
    Ok(match serde_json::from_str::<Value>(line)? {
        Value::Array(values) => Item::Tuple(values),
        value => Item::Value(value),
    })
}
