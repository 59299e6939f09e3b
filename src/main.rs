// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! basalt CLI - drives the compiler backend from flattened listings
//!
//! ## Commands
//!
//! - `opt`: optimize a listing and print the result
//! - `asm`: optimize and assemble a listing, then disassemble it
//! - `demo`: compile a built-in sample module end to end

mod demo;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use basalt_compiler::compiler::dis::disassemble;
use basalt_compiler::compiler::flat::{self, FlatListing};
use basalt_compiler::compiler::flowgraph::PassConfig;
use basalt_compiler::{CodeObject, CompileOptions, OptimizeLevel, compile};
use clap::{Args, Parser, Subcommand};
use owo_colors::OwoColorize;
use tracing::debug;

#[derive(Parser)]
#[command(
    name = "basalt",
    about = "Bytecode compiler backend: optimize, assemble and disassemble",
    version,
    author = "Pegasus Heavy Industries"
)]
struct Cli {
    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Optimize a flattened listing and print it
    Opt {
        /// Listing file
        file: PathBuf,

        #[command(flatten)]
        level: Level,
    },
    /// Optimize and assemble a listing, then print its disassembly
    Asm {
        /// Listing file
        file: PathBuf,

        #[command(flatten)]
        level: Level,
    },
    /// Compile the built-in sample module and disassemble every code object
    Demo {
        #[command(flatten)]
        level: Level,
    },
}

#[derive(Args)]
struct Level {
    /// Optimization level (0, 1 or 2)
    #[arg(short = 'O', default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
    optimize: u8,
}

impl Level {
    fn options(&self) -> CompileOptions {
        let level = OptimizeLevel::from_level(self.optimize).unwrap_or_default();
        CompileOptions::new().with_optimize(level)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("basalt=debug,basalt_compiler=debug")
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("basalt=warn")
            .init();
    }

    let color = !cli.no_color;
    let result = match &cli.command {
        Command::Opt { file, level } => run_opt(file, &level.options()),
        Command::Asm { file, level } => run_asm(file, &level.options(), color),
        Command::Demo { level } => run_demo(&level.options(), color),
    };

    if let Err(e) = result {
        if color {
            eprintln!("{}: {:#}", "Error".red().bold(), e);
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
    Ok(())
}

fn read_listing(path: &Path) -> anyhow::Result<FlatListing> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let listing = flat::parse_listing(&text).with_context(|| format!("in {}", path.display()))?;
    debug!(
        "parsed {} items, {} constants from {}",
        listing.items.len(),
        listing.consts.len(),
        path.display()
    );
    Ok(listing)
}

fn run_opt(path: &Path, options: &CompileOptions) -> anyhow::Result<()> {
    let listing = read_listing(path)?;
    let config = PassConfig::from_options(options);
    let (items, consts) = flat::optimize_with(
        &listing.items,
        listing.consts,
        listing.varnames.len(),
        &config,
    )?;
    let optimized = FlatListing {
        items,
        consts,
        names: listing.names,
        varnames: listing.varnames,
    };
    print!("{}", flat::format_listing(&optimized));
    Ok(())
}

fn run_asm(path: &Path, options: &CompileOptions, color: bool) -> anyhow::Result<()> {
    let listing = read_listing(path)?;
    let code = flat::assemble(&listing, &PassConfig::from_options(options))?;
    print_code(&code, color)
}

fn run_demo(options: &CompileOptions, color: bool) -> anyhow::Result<()> {
    let module = demo::sample_module();
    let options = options.clone().with_filename("<demo>");
    let output = compile(&module, &options)?;
    for warning in &output.warnings {
        if color {
            eprintln!("{}: {}", "Warning".yellow().bold(), warning);
        } else {
            eprintln!("Warning: {}", warning);
        }
    }
    print_code(&output.code, color)
}

/// Disassembles `code` and every code object nested in it, depth first.
fn print_code(code: &CodeObject, color: bool) -> anyhow::Result<()> {
    let listing = disassemble(code)?;
    let (header, body) = listing.split_once('\n').unwrap_or((listing.as_str(), ""));
    if color {
        println!("{}", header.cyan().bold());
    } else {
        println!("{header}");
    }
    print!("{body}");
    for child in code.nested() {
        println!();
        print_code(child, color)?;
    }
    Ok(())
}
