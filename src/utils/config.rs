//! Configuration overlay macro: defaults first, TOML on top.

/// Builds a configuration struct from its `Default` values, then lets an
/// optional TOML string override the named fields. Any key in the TOML
/// that is not among the named fields is an error, so typos surface
/// instead of silently keeping a default.
///
/// ```text
/// let config = parsed_config!(config_str => GroupConfig;
///                             window_size, block_size)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+ $(,)?) => {{
        (|| -> Result<$config_type, SquallError> {
            let mut config = <$config_type>::default();
            let config_str: Option<&str> = $config_str;
            let Some(config_str) = config_str else {
                return Ok(config);
            };

            let mut table = config_str.parse::<toml::Table>()?;
            $(
                if let Some(value) = table.remove(stringify!($field)) {
                    config.$field = value.try_into()?;
                }
            )+

            // whatever is left in the table matched no known field
            match table.keys().next() {
                Some(stray) => Err(SquallError(format!(
                    "unrecognized config field '{}'",
                    stray
                ))),
                None => Ok(config),
            }
        })()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::SquallError;

    #[derive(Debug, PartialEq)]
    struct GustConfig {
        window: usize,
        path: String,
        jitter: f64,
    }

    impl Default for GustConfig {
        fn default() -> Self {
            GustConfig {
                window: 3,
                path: "/tmp/gust.wal".into(),
                jitter: 0.5,
            }
        }
    }

    #[test]
    fn absent_string_keeps_defaults() -> Result<(), SquallError> {
        let config =
            parsed_config!(None => GustConfig; window, path, jitter)?;
        assert_eq!(config, GustConfig::default());
        Ok(())
    }

    #[test]
    fn overlay_touches_only_named_keys() -> Result<(), SquallError> {
        let overlay = Some("window = 8\njitter = 0.25");
        let config =
            parsed_config!(overlay => GustConfig; window, path, jitter)?;
        assert_eq!(config.window, 8);
        assert_eq!(config.jitter, 0.25);
        assert_eq!(config.path, "/tmp/gust.wal");
        Ok(())
    }

    #[test]
    fn stray_keys_are_rejected() {
        let overlay = Some("wimdow = 8"); // typo
        assert!(
            parsed_config!(overlay => GustConfig; window).is_err()
        );
    }

    #[test]
    fn unnamed_fields_cannot_be_overridden() {
        // `jitter` exists on the struct but is not opened up here
        let overlay = Some("jitter = 0.9");
        assert!(
            parsed_config!(overlay => GustConfig; window, path)
                .is_err()
        );
    }
}
