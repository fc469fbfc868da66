use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dmgsmith::layout::FilesystemLayout;

use crate::commands::{build::BuildArgs, download::DownloadArgs, list::ListArgs};

#[derive(Parser, Debug)]
#[command(name = "dmgsmith", author, version, about = "Build deployable disk images from OS installers")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Args, Debug)]
pub struct GlobalFlags {
    /// Home directory holding the update cache, logs and profiles
    #[arg(long, global = true, env = "DMGSMITH_HOME")]
    pub home: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl GlobalFlags {
    /// Resolve the home directory and create what it should contain.
    pub fn layout(&self) -> anyhow::Result<FilesystemLayout> {
        let layout = match &self.home {
            Some(home) => FilesystemLayout::new(home.clone()),
            None => FilesystemLayout::from_env()?,
        };
        layout.prepare()?;
        Ok(layout)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build an image
    Build(BuildArgs),

    /// List the updates for an OS version and build
    #[command(visible_alias = "ls")]
    List(ListArgs),

    /// Download the updates for an OS version and build
    Download(DownloadArgs),
}
