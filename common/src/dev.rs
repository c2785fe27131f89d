// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logger construction helpers for tests and dev tools.

use slog::o;
use slog::Drain;
use slog::Logger;

/// Build a logger that writes human-readable output to stderr.
pub fn stderr_logger(name: &'static str) -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("component" => name))
}

/// Build a logger that discards everything, for tests that don't care
/// about output.
pub fn null_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}
