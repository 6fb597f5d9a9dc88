// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use elevate_areas::{Overlay, CODE_BLOCK_SIZE, TRANSFER_WINDOW};
use elevate_core::action::ElevatedAction;
use elevate_core::digest::reference_words;
use elevate_core::session;
use elevate_core::ElevatedContext;
use elevate_sim::SoftAes;
use hex::FromHex;
use log::{debug as okay, error, info};
use serde::Serialize;
use std::path::PathBuf;

mod logger;
mod scenario;

use scenario::Scenario;

#[derive(Debug, Parser)]
struct ScenarioArgs {
    /// Scenario file (TOML)
    #[clap(short, long)]
    scenario: PathBuf,
}

#[derive(Debug, Parser)]
struct ImageArgs {
    #[clap(short = 'i', long = "image", help = "code image (binary)")]
    image: PathBuf,
    /// Address the image is loaded at in backing storage
    #[arg(long, default_value_t = 0, value_parser = parse_int::parse::<u32>)]
    base: u32,
}

#[derive(Debug, Parser)]
enum Command {
    /// Compute the reference words for a scenario's ranges over an image
    Sign {
        #[clap(flatten)]
        scenario: ScenarioArgs,
        #[clap(flatten)]
        image: ImageArgs,
        /// Print JSON instead of text
        #[clap(long)]
        json: bool,
    },
    /// Run one enter / protected action / exit cycle on the simulator
    Simulate {
        #[clap(flatten)]
        scenario: ScenarioArgs,
        #[clap(flatten)]
        image: ImageArgs,
        /// The two reference words provisioned into the chip
        #[arg(long, required = true, num_args = 2, value_parser = parse_int::parse::<u32>)]
        reference: Vec<u32>,
        /// Salt for the protected action, as 32 hex digits
        #[arg(long, default_value = "00000000000000000000000000000000", value_parser = parse_salt)]
        salt: [u8; 16],
        /// Address the caller returns to
        #[arg(long, default_value_t = 0, value_parser = parse_int::parse::<u32>)]
        return_addr: u32,
        #[clap(short, long)]
        verbose: bool,
    },
    /// Print the sorted overlay range registry of a scenario, and whether
    /// each overlay's code would stay resident through `enter`
    Ranges {
        #[clap(flatten)]
        scenario: ScenarioArgs,
        /// Only check this overlay
        #[arg(long, value_enum)]
        overlay: Option<Overlay>,
    },
}

#[derive(Debug, Parser)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

fn parse_salt(s: &str) -> Result<[u8; 16], hex::FromHexError> {
    <[u8; 16]>::from_hex(s)
}

#[derive(Serialize)]
struct SignOutput {
    reference: [u32; 2],
    seed: String,
    ranges: Vec<[u32; 2]>,
}

fn main() -> Result<()> {
    let cmd = Opts::parse();

    // Simulate has a custom logger; everyone else can use the default
    match &cmd.cmd {
        Command::Simulate { verbose, .. } => logger::init_simulate_logger(*verbose),
        _ => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .init()
        }
    }

    match cmd.cmd {
        Command::Sign {
            scenario,
            image,
            json,
        } => {
            let s = Scenario::load(&scenario.scenario)?;
            let registry = s.transition.registry().context("bad overlay ranges")?;
            let bytes = std::fs::read(&image.image)
                .with_context(|| format!("could not read {:?}", image.image))?;
            let reference =
                reference_words(&mut SoftAes, s.transition.seed, &bytes, image.base, &registry);

            if json {
                let out = SignOutput {
                    reference,
                    seed: hex::encode(s.transition.seed),
                    ranges: registry
                        .as_slice()
                        .iter()
                        .map(|r| [r.start(), r.end()])
                        .collect(),
                };
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("{:#010x} {:#010x}", reference[0], reference[1]);
            }
            info!(
                "signed {} range(s) over {} byte image",
                registry.len(),
                bytes.len()
            );
        }
        Command::Simulate {
            scenario,
            image,
            reference,
            salt,
            return_addr,
            verbose: _,
        } => {
            let s = Scenario::load(&scenario.scenario)?;
            let bytes = std::fs::read(&image.image)
                .with_context(|| format!("could not read {:?}", image.image))?;

            let mut sim = s.platform();
            let end = image.base as usize + bytes.len();
            if end > elevate_sim::BACKING_SIZE {
                bail!("image ends at {end:#x}, past the end of backing storage");
            }
            sim.load_image(image.base, &bytes);
            sim.reference = [reference[0], reference[1]];

            let mut ctx = ElevatedContext::new(s.transition).context("bad transition config")?;
            let steps = [
                ("enter", ElevatedAction::TransitionEnter),
                ("protect", ElevatedAction::TransitionProtect { salt }),
                ("exit", ElevatedAction::TransitionExit),
            ];
            for (name, action) in steps {
                if let Err(e) = session::call(&mut ctx, &mut sim, action, return_addr) {
                    error!("{name}: {e} ({:?})", e.completion());
                    println!("{}", "FAIL".red());
                    bail!("simulation stopped at {name}");
                }
                match sim.trust_phase() {
                    Some(p) => okay!("{name}: phase is {p}"),
                    None => bail!("{name}: phase register reads {:#010x}", sim.phase),
                }
            }
            info!(
                "{} cleanup(s), {} block(s) resident",
                ctx.cleanup_count(),
                sim.resident_blocks().len()
            );
            ctx.teardown();
            println!("{}", "PASS".green());
        }
        Command::Ranges { scenario, overlay } => {
            let s = Scenario::load(&scenario.scenario)?;
            let registry = s.transition.registry().context("bad overlay ranges")?;
            if registry.is_empty() {
                println!("{}: no ranges registered; enter can never succeed", "WARNING".yellow());
            }
            for r in registry.as_slice() {
                println!(
                    "{:#010x}..{:#010x}  {:>4} window(s)",
                    r.start(),
                    r.end(),
                    r.len() / TRANSFER_WINDOW
                );
            }
            for o in s.overlay.iter().filter(|o| overlay.map_or(true, |n| n == o.name)) {
                let covered = (o.start..o.end)
                    .step_by(CODE_BLOCK_SIZE as usize)
                    .all(|b| registry.covers_block(b, CODE_BLOCK_SIZE));
                if covered {
                    println!("{:?}: {}", o.name, "covered".green());
                } else {
                    println!("{:?}: {} (evicted on enter)", o.name, "not covered".red());
                }
            }
        }
    }

    Ok(())
}
