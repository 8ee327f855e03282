//! Shell completion scripts for `trailsync`

use std::io::{self, Write};
use std::path::Path;

use clap::CommandFactory;
use clap_complete::{generate, shells};

use crate::cli::{Cli, CompletionShell};
use crate::error::CliError;

/// Completion script covering every subcommand, including the nested
/// `failed list|review|retry|delete` group and the global `--db-path` flag
pub fn completion_script(shell: CompletionShell) -> Vec<u8> {
    let mut command = Cli::command();
    let bin_name = command.get_name().to_string();
    let mut script = Vec::new();
    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut command, &bin_name, &mut script),
        CompletionShell::Zsh => generate(shells::Zsh, &mut command, &bin_name, &mut script),
        CompletionShell::Fish => generate(shells::Fish, &mut command, &bin_name, &mut script),
    }
    script
}

/// Print the script, or write it to `output_path` and print that path.
///
/// Needs no queue database, so it runs before configuration is loaded.
pub fn run_completions(shell: CompletionShell, output_path: Option<&Path>) -> Result<(), CliError> {
    let script = completion_script(shell);

    match output_path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &script)?;
            println!("{}", path.display());
        }
        None => io::stdout().write_all(&script)?,
    }
    Ok(())
}
