/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
 */

use anyhow::Result;
use clap::Parser;
use nyx::{config, log, Nyx, Options};
use std::path::{Path, PathBuf};
use std::process::exit;
use tracing::{event, Level};

#[derive(Parser, Debug)]
#[clap(version, about = "A small Linux process supervisor")]
struct Args {
    /// Log via the system logger
    #[clap(short = 's', long)]
    syslog: bool,

    /// Only log errors
    #[clap(short = 'q', long)]
    quiet: bool,

    /// Disable ANSI colouring
    #[clap(short = 'C', long = "no-color")]
    no_color: bool,

    /// Path to the watch configuration file
    config: PathBuf,
}

fn main() {
    let args = Args::parse();
    let options = Options {
        syslog: args.syslog,
        quiet: args.quiet,
        no_color: args.no_color,
    };
    log::init(&options);

    if let Err(err) = run(&args.config, options) {
        event!(Level::ERROR, "{err:#}");
        exit(1);
    }
}

fn run(config: &Path, options: Options) -> Result<()> {
    let watches = config::load(config)?;

    let mut nyx = Nyx::initialize(options)?;
    event!(
        Level::INFO,
        "nyx starting as pid {} (PID directory '{}')",
        nyx.pid(),
        nyx.pid_dir().display()
    );

    nyx.add_watches(watches)?;
    nyx.install_signals()?;
    nyx.watches_init()?;

    let result = nyx.run();
    nyx.destroy();
    result
}
