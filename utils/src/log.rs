use std::str::FromStr;

use anyhow::{anyhow, Result};
use log::LevelFilter;
use log4rs::{
    append::console::ConsoleAppender,
    config::{Appender, Root},
    encode::json::JsonEncoder,
};

/// parse a level name such as `info` or `DEBUG`
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    LevelFilter::from_str(level.trim()).map_err(|_| anyhow!("invalid log level: {}", level))
}

pub fn init_log(level: &str) -> Result<()> {
    let stdout: ConsoleAppender = ConsoleAppender::builder()
        .encoder(Box::new(JsonEncoder::new()))
        .build();
    let log_config = log4rs::config::Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(parse_level(level)?))?;
    log4rs::init_config(log_config)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("info").unwrap(), LevelFilter::Info);
        assert_eq!(parse_level(" DEBUG ").unwrap(), LevelFilter::Debug);
        assert!(parse_level("loud").is_err());
    }
}
