//! Renders the `modilink` man page from the clap definition in `src/cli.rs`.

use std::{env, fs, path::PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli.rs"]
mod cli;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=src/cli.rs");
    println!("cargo:rerun-if-changed=build.rs");

    let root = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?);
    let man_dir = root.join("target").join("man");
    fs::create_dir_all(&man_dir)?;

    let cmd = cli::Cli::command();
    let page = man_dir.join(format!("{}.1", cmd.get_name()));
    let mut rendered = Vec::new();
    Man::new(cmd).render(&mut rendered)?;
    fs::write(page, rendered)?;

    Ok(())
}
