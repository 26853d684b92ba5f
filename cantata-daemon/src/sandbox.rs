// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Builder process isolation.
//!
//! The engine only depends on this interface; platform-specific
//! isolation (chroot, namespaces, resource limits) plugs in behind it.
//! [`NoSandbox`] runs the builder as a plain child process with a clean
//! environment, stdin on the null device, and its own process group so
//! supervision kills reach the whole tree.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::build_users::UserLock;

/// A running builder.
pub struct SandboxChild {
    child: Child,
}

impl SandboxChild {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

/// How to launch a builder.
pub trait Sandbox {
    fn spawn(
        &self,
        builder: &str,
        args: &[&str],
        env: &BTreeMap<String, String>,
        work_dir: &Path,
        user: Option<&UserLock>,
    ) -> std::io::Result<SandboxChild>;
}

/// No isolation: a plain subprocess.
pub struct NoSandbox;

impl NoSandbox {
    pub fn new() -> Self {
        NoSandbox
    }
}

impl Default for NoSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Sandbox for NoSandbox {
    fn spawn(
        &self,
        builder: &str,
        args: &[&str],
        env: &BTreeMap<String, String>,
        work_dir: &Path,
        user: Option<&UserLock>,
    ) -> std::io::Result<SandboxChild> {
        let mut command = Command::new(builder);
        command
            .args(args)
            .env_clear()
            .envs(env)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(user) = user {
            command.uid(user.uid());
        }
        let child = command.spawn()?;
        Ok(SandboxChild { child })
    }
}
