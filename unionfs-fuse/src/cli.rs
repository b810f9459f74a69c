//! Command-line surface, mirroring the `dirs=` mount-option grammar from
//! spec §4.1/§6 and the flag set `fuser`'s own examples expose.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "unionfs-fuse", about = "A stackable union filesystem over FUSE")]
pub struct Args {
    /// Where to mount the union.
    pub mountpoint: PathBuf,

    /// Branch specification: `dir[=mode](:dir[=mode])*`, mode one of
    /// `rw`/`ro`, branch 0 (leftmost) defaulting to and required to be `rw`.
    #[arg(short = 'o', long = "dirs", value_name = "dirs=<spec>")]
    pub dirs: String,

    /// Enable fuse-level debug logging in addition to `RUST_LOG`.
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Allow users other than the mounting user to access the filesystem.
    #[arg(long)]
    pub allow_other: bool,
}
