// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::Drain;
use vmadm_config::{LogFormat, ParseError};

/// Builds the root logger described by `cfg`.
///
/// Records at or above the configured level go to stdout, either through a
/// terminal formatter or as bunyan JSON. Every record is also handed to the
/// slog-dtrace probes regardless of level.
pub fn build_logger(
    name: &'static str,
    cfg: &vmadm_config::Log,
) -> Result<slog::Logger, ParseError> {
    let level = cfg.level()?;
    let terminal = match cfg.format {
        LogFormat::Auto => atty::is(atty::Stream::Stdout),
        LogFormat::Terminal => true,
        LogFormat::Bunyan => false,
    };

    let main_drain = if terminal {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain =
            slog_bunyan::with_name(name, std::io::stdout()).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let (dtrace_drain, probe_reg) = slog_dtrace::Dtrace::new();

    let filtered_main = slog::LevelFilter::new(main_drain, level);

    let log = slog::Logger::root(
        slog::Duplicate::new(filtered_main.fuse(), dtrace_drain.fuse()).fuse(),
        slog::o!(),
    );

    if let slog_dtrace::ProbeRegistration::Failed(err) = probe_reg {
        slog::error!(&log, "Error registering slog-dtrace probes: {:?}", err);
    }

    Ok(log)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_is_rejected() {
        let cfg = vmadm_config::Log {
            level: "chatty".to_string(),
            format: LogFormat::Bunyan,
        };
        assert!(matches!(
            build_logger("vmadm", &cfg),
            Err(ParseError::InvalidLogLevel(_))
        ));
    }
}
