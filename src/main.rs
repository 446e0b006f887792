use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use elf_patch::{rewrite, RewriteOptions};

/// Change the shared-library dependencies recorded in ELF executables and
/// shared objects.
#[derive(Parser)]
#[command(name = "elf-patch", version, about)]
struct Args {
    /// Replace a declared dependency on LIBRARY with NEW_LIBRARY
    #[arg(long, num_args = 2, value_names = ["LIBRARY", "NEW_LIBRARY"])]
    replace_needed: Vec<String>,

    /// Write the result to FILE instead of overwriting the input; '@PATH'
    /// reads the value from the file at PATH
    #[arg(long, value_name = "FILE")]
    output: Option<String>,

    /// Print debug output on standard error
    #[arg(long)]
    debug: bool,

    /// ELF files to patch
    #[arg(required = true, value_name = "FILENAME")]
    files: Vec<PathBuf>,
}

/// An argument of the form `@PATH` stands for the contents of the file at
/// `PATH`.
fn resolve_argument(arg: &str) -> Result<String> {
    if let Some(path) = arg.strip_prefix('@') {
        let contents =
            fs::read(path).with_context(|| format!("reading argument file '{path}'"))?;
        return Ok(String::from_utf8_lossy(&contents).into_owned());
    }
    Ok(arg.to_string())
}

fn run() -> Result<()> {
    let args = Args::parse();

    let debug = args.debug
        || std::env::var_os("PATCHELF_DEBUG").is_some_and(|value| !value.is_empty());
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if debug { "debug" } else { "warn" }),
    )
    .init();

    let mut renames: HashMap<String, String> = HashMap::new();
    for pair in args.replace_needed.chunks(2) {
        if let [old, new] = pair {
            renames.insert(old.clone(), new.clone());
        }
    }

    let output = args.output.as_deref().map(resolve_argument).transpose()?;
    if output.is_some() && args.files.len() != 1 {
        bail!("--output option only allowed with single input file");
    }

    let always_write = true;
    let options = RewriteOptions::default();

    for file in &args.files {
        log::debug!("patching ELF file '{}'", file.display());

        let contents =
            fs::read(file).with_context(|| format!("reading '{}'", file.display()))?;
        let outcome = rewrite(contents, &renames, options.clone())
            .with_context(|| format!("patching '{}'", file.display()))?;

        if outcome.changed || always_write {
            if !outcome.changed {
                log::debug!("not modified, but always writing");
            }
            let dest = output.as_deref().map(Path::new).unwrap_or(file);
            log::debug!("writing {}", dest.display());
            fs::write(dest, &outcome.bytes)
                .with_context(|| format!("writing '{}'", dest.display()))?;
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("elf-patch: {err:#}");
            ExitCode::FAILURE
        }
    }
}
