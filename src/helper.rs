use std::str::FromStr;

/// Read and parse the environment variable `key`. An unset or empty variable gives `None`, a
/// value that fails to parse is an error.
pub fn parse_from_env<T: FromStr>(key: &str) -> anyhow::Result<Option<T>> {
    let value = match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => return Ok(None),
    };

    value.trim().parse::<T>().map(Some).map_err(|_| {
        anyhow::anyhow!(
            "invalid value {value} in ${key}, expect type: {}",
            std::any::type_name::<T>()
        )
    })
}

#[test]
fn test_parse_from_env() {
    std::env::set_var("HIT_COUNTER_HELPER_TEST_PORT", " 8080 ");
    assert_eq!(
        parse_from_env::<u16>("HIT_COUNTER_HELPER_TEST_PORT").unwrap(),
        Some(8080)
    );

    std::env::set_var("HIT_COUNTER_HELPER_TEST_PORT", "eighty");
    assert!(parse_from_env::<u16>("HIT_COUNTER_HELPER_TEST_PORT").is_err());

    std::env::remove_var("HIT_COUNTER_HELPER_TEST_PORT");
    assert_eq!(
        parse_from_env::<u16>("HIT_COUNTER_HELPER_TEST_PORT").unwrap(),
        None
    );
}
