//! Running commands under `fakeroot` with a persistent state file.
//!
//! Files extracted from archives keep their ownership and permissions only in the
//! state of the `fakeroot` session which extracted them. Every subsequent command
//! operating on those files has to run with the same state.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use xscript::{Cmd, ParentEnv, Run};

use crate::{Error, IoContext, Result};

/// Path of the `fakeroot` executable.
const FAKEROOT: &str = "fakeroot";

/// Session of `fakeroot` identified by its state file.
#[derive(Debug, Clone)]
pub struct FakeRoot {
    state: PathBuf,
}

impl FakeRoot {
    /// Create a session with a fresh state file at the given path.
    ///
    /// The state file is created by the first command.
    pub fn new(state: PathBuf) -> Self {
        Self { state }
    }

    /// Create a session at `state` which starts with a copy of `parent`'s state.
    pub fn derive(parent: &FakeRoot, state: PathBuf) -> Result<Self> {
        if parent.state.exists() {
            fs::copy(&parent.state, &state).context(format!(
                "unable to copy fakeroot state {}",
                parent.state.display()
            ))?;
        }
        Ok(Self { state })
    }

    /// Path of the state file.
    pub fn state(&self) -> &Path {
        &self.state
    }

    /// Build a command running `program` with `args` in this session.
    pub fn cmd<I, A>(&self, program: impl AsRef<OsStr>, args: I) -> Cmd<OsString>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<OsStr>,
    {
        let mut cmd: Cmd<OsString> = Cmd::new(FAKEROOT);
        cmd.add_arg("-u").add_arg("-s").add_arg(&self.state);
        if self.state.exists() {
            cmd.add_arg("-i").add_arg(&self.state);
        }
        cmd.add_arg("--").add_arg(program);
        for arg in args {
            cmd.add_arg(arg);
        }
        cmd
    }

    /// Run `program` with `args` in this session.
    pub fn run<I, A>(&self, program: impl AsRef<OsStr>, args: I) -> Result<()>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<OsStr>,
    {
        let program = program.as_ref();
        let cmd = self.cmd(program, args);
        debug!("running {cmd}");
        ParentEnv.run(cmd).map_err(|error| {
            Error::tool(
                format!("{} failed under fakeroot", program.to_string_lossy()),
                error,
            )
        })?;
        Ok(())
    }

    /// Recursively copy `src` into the directory `dst` preserving ownership.
    pub fn copy(&self, src: &Path, dst: &Path) -> Result<()> {
        self.run("cp", [OsStr::new("-a"), src.as_os_str(), dst.as_os_str()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fakeroot_cmd() {
        let fakeroot = FakeRoot::new(PathBuf::from("/nonexistent/fakeroot.state"));
        let cmd = fakeroot.cmd("tar", ["-xpf", "archive.tar"]);
        let args = cmd
            .args()
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(
            args,
            [
                "-u",
                "-s",
                "/nonexistent/fakeroot.state",
                "--",
                "tar",
                "-xpf",
                "archive.tar"
            ]
        );
    }
}
