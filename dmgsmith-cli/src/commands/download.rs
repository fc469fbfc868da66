use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use dmgsmith::cache::HttpFetcher;

use super::{download_updates, load_profiles, open_cache, profile, update_package};

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// OS version, e.g. 10.11.6
    pub version: String,

    /// OS build, e.g. 15G31
    pub build: String,

    /// Update profiles to use instead of the ones in the home directory
    #[arg(long)]
    pub profiles: Option<PathBuf>,
}

pub async fn execute(args: DownloadArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let layout = global.layout()?;
    let profiles = load_profiles(&layout, args.profiles.as_deref())?;
    let cache = open_cache(&layout, &profiles)?;

    let missing: Vec<_> = profile(&profiles, &args.version, &args.build)?
        .iter()
        .filter(|u| !cache.is_cached(&u.sha1))
        .map(|u| update_package(&cache, u))
        .collect();

    if !missing.is_empty() {
        download_updates(Arc::clone(&cache), missing, Arc::new(HttpFetcher::new()?)).await?;
    }

    println!("All updates for {} {} downloaded", args.version, args.build);
    Ok(())
}
