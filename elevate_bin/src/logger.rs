// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use log::{Level, LevelFilter};
use std::io::Write as _;

fn tag(level: Level) -> &'static str {
    match level {
        Level::Error => "FAIL",
        Level::Warn => "WARN",
        Level::Info => "    ",
        Level::Debug => "OKAY",
        Level::Trace => "....",
    }
}

/// Logger for `simulate`: debug records are step confirmations and print as
/// OKAY. `verbose` adds the per-block trace.
pub fn init_simulate_logger(verbose: bool) {
    let level = if verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Debug
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            let style = buf.default_level_style(record.level());
            let module = record
                .module_path()
                .and_then(|m| m.rsplit("::").next())
                .unwrap_or_default();
            writeln!(
                buf,
                "{} {module:<10} {}",
                style.value(tag(record.level())),
                record.args()
            )
        })
        .init();
}
