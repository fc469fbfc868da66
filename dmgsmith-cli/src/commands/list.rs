use std::path::PathBuf;

use clap::Args;
use dmgsmith::util::format_bytes;

use super::{load_profiles, open_cache, profile};

#[derive(Args, Debug)]
pub struct ListArgs {
    /// OS version, e.g. 10.11.6
    pub version: String,

    /// OS build, e.g. 15G31
    pub build: String,

    /// Update profiles to use instead of the ones in the home directory
    #[arg(long)]
    pub profiles: Option<PathBuf>,
}

pub async fn execute(args: ListArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let layout = global.layout()?;
    let profiles = load_profiles(&layout, args.profiles.as_deref())?;
    let cache = open_cache(&layout, &profiles)?;
    let updates = profile(&profiles, &args.version, &args.build)?;

    println!(
        "{} update{} for {} {}:",
        updates.len(),
        if updates.len() == 1 { "" } else { "s" },
        args.version,
        args.build
    );
    for update in updates {
        println!(
            "    {}{} ({})",
            if cache.is_cached(&update.sha1) { "[cached] " } else { "" },
            update.name,
            format_bytes(update.size)
        );
    }
    Ok(())
}
