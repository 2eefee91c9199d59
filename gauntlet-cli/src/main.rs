// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;
use color_eyre::Result;
use gauntlet_cli::GauntletApp;

fn main() -> Result<()> {
    color_eyre::install()?;

    let opts = GauntletApp::parse();
    let output = opts.init_output();

    let mut out = String::new();
    match opts.exec(output, &mut out) {
        Ok(code) => {
            print!("{out}");
            std::process::exit(code)
        }
        Err(error) => {
            print!("{out}");
            error.display_to_stderr(&output.stderr_styles());
            std::process::exit(error.process_exit_code())
        }
    }
}
