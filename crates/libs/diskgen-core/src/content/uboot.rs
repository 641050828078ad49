use std::fmt;
use std::path::PathBuf;

use super::{ContentType, ResultFile};
use crate::context::BuildContext;
use crate::fsutils::Sink;
use crate::size::SizeType;
use crate::uboot_env::UBootEnv;
use crate::{bail, IoContext, Result};

/// Binary U-Boot environment.
///
/// Variables are read from an optional text file and then overridden by explicitly
/// given variables.
#[derive(Debug, Default)]
pub struct UBootEnvContent {
    size: SizeType,
    file: Option<PathBuf>,
    vars: UBootEnv,
    data: Option<Vec<u8>>,
    result: ResultFile,
}

impl UBootEnvContent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read variables from a text file with `key=value` lines.
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Set a variable.
    pub fn with_var(mut self, key: &str, value: impl AsRef<str>) -> Self {
        self.vars.set(key, value);
        self
    }

    /// The encoded environment, available after preparation.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }
}

impl ContentType for UBootEnvContent {
    fn size(&self) -> SizeType {
        self.size
    }

    fn set_size(&mut self, size: SizeType) {
        self.size = size;
    }

    fn prepare(&mut self, _: &mut BuildContext) -> Result<()> {
        let Some(size) = self.size.get() else {
            bail!("Size for U-Boot environment must be defined");
        };
        let mut env = match &self.file {
            Some(file) => UBootEnv::load_text(file)?,
            None => UBootEnv::new(),
        };
        env.merge(&self.vars);
        self.data = Some(env.to_bytes(size)?);
        Ok(())
    }

    fn write(&mut self, ctx: &BuildContext, sink: &mut dyn Sink) -> Result<()> {
        let Some(data) = &self.data else {
            bail!("U-Boot environment has not been prepared");
        };
        self.result.write(ctx, ".env", self.size, sink, |path| {
            std::fs::write(path, data).context("unable to write U-Boot environment")
        })
    }
}

impl fmt::Display for UBootEnvContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "UBootEnv({})", file.display()),
            None => f.write_str("UBootEnv"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undefined_size() {
        let mut ctx = BuildContext::new().unwrap();
        let mut content = UBootEnvContent::new();
        let error = content.prepare(&mut ctx).unwrap_err();
        assert_eq!(
            error.to_string(),
            "Size for U-Boot environment must be defined"
        );
    }

    #[test]
    fn test_file_and_vars() {
        let mut ctx = BuildContext::new().unwrap();
        let file = ctx.work_dir().join("env.txt");
        std::fs::write(&file, "# defaults\nbootdelay=3\nbootcmd = run boot\n").unwrap();
        let mut content = UBootEnvContent::new()
            .with_file(&file)
            .with_var("bootdelay", "0");
        content.set_size(SizeType::new(256));
        content.prepare(&mut ctx).unwrap();
        let env = UBootEnv::from_bytes(content.data().unwrap()).unwrap();
        assert_eq!(env.get("bootdelay"), Some("0"));
        assert_eq!(env.get("bootcmd"), Some("run boot"));

        let mut first = Vec::new();
        content.write(&ctx, &mut first).unwrap();
        let mut second = Vec::new();
        content.write(&ctx, &mut second).unwrap();
        assert_eq!(first.len(), 256);
        assert_eq!(first, second);
        assert_eq!(first, content.data().unwrap());
    }

    #[test]
    fn test_missing_file() {
        let mut ctx = BuildContext::new().unwrap();
        let mut content = UBootEnvContent::new().with_file("/nonexistent/env.txt");
        content.set_size(SizeType::new(256));
        let error = content.prepare(&mut ctx).unwrap_err();
        assert_eq!(error.to_string(), "File /nonexistent/env.txt does not exist");
    }

    #[test]
    fn test_overflow() {
        let mut ctx = BuildContext::new().unwrap();
        let mut content = UBootEnvContent::new().with_var("key", "x".repeat(600));
        content.set_size(SizeType::new(64));
        let error = content.prepare(&mut ctx).unwrap_err();
        // 4 + len("key=") + 600 + 2 terminators - 64
        assert_eq!(
            error.to_string(),
            "U-Boot environment variables overflow storage area by 546 bytes"
        );
    }
}
