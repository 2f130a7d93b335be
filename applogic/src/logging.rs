// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Once;

use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::SubscriberExt,
    registry,
    util::{SubscriberInitExt, TryInitError},
};

static INIT_LOGGER_ONCE: Once = Once::new();

/// Install the global subscriber. Calling this more than once is a no-op.
pub fn init_logger() {
    let is_logger_initialized = INIT_LOGGER_ONCE.is_completed();

    INIT_LOGGER_ONCE.call_once(|| {
        if let Err(error) = do_init_logger() {
            // Another subscriber was installed by the embedding application
            warn!(%error, "failed to init logger");
        }
    });

    info!(is_logger_initialized, "init_logger");
}

fn do_init_logger() -> Result<(), TryInitError> {
    let default_level = if cfg!(debug_assertions) {
        LevelFilter::INFO
    } else {
        LevelFilter::WARN
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    registry()
        .with(env_filter)
        .with(fmt::Layer::new().with_target(true))
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logger_is_idempotent() {
        init_logger();
        init_logger();
        assert!(INIT_LOGGER_ONCE.is_completed());
    }
}
