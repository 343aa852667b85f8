use std::fmt;

use clap::Args;

#[derive(Args, Debug, Clone)]
pub struct Version;

#[derive(Debug)]
pub struct VersionOutput {
    pub version: &'static str,
    pub fuse: bool,
}

impl fmt::Display for VersionOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "matrixfs {} ({})",
            self.version,
            if self.fuse { "fuse" } else { "no fuse" }
        )
    }
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Version {
    type Error = std::convert::Infallible;
    type Output = VersionOutput;

    async fn execute(&self, _ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        Ok(VersionOutput {
            version: env!("CARGO_PKG_VERSION"),
            fuse: cfg!(feature = "fuse"),
        })
    }
}
