use googletest::prelude::*;
use test_casing::{TestCases, cases, test_casing};

use super::*;

const CANONICAL_KEY_VALID_CASES: TestCases<&'static str> = cases! {
    [
        "full_name",
        "a",
        "phone2",
        "selfie",
    ]
};

#[test]
fn test_canonical_key_valid_cases_len() {
    assert_eq!(4, CANONICAL_KEY_VALID_CASES.into_iter().count());
}

#[test_casing(4, CANONICAL_KEY_VALID_CASES)]
#[gtest]
fn test_canonical_key_valid(input: &'static str) -> anyhow::Result<()> {
    let key = CanonicalKey::try_from(input)?;
    expect_that!(key.as_str(), eq(input));
    expect_that!(CanonicalKey::try_from(input.to_string()), ok(eq(&key)));

    let input_json = serde_json::to_string(input)?;
    expect_that!(
        serde_json::from_str::<CanonicalKey>(&input_json),
        ok(eq(&key))
    );

    Ok(())
}

const CANONICAL_KEY_INVALID_CASES: TestCases<&'static str> = cases! {
    [
        "",
        "self",
        "First_name",
        "1st",
        "_name",
        "full-name",
        "full name",
    ]
};

#[test]
fn test_canonical_key_invalid_cases_len() {
    assert_eq!(7, CANONICAL_KEY_INVALID_CASES.into_iter().count());
}

#[test_casing(7, CANONICAL_KEY_INVALID_CASES)]
#[gtest]
fn test_canonical_key_invalid(input: &'static str) -> anyhow::Result<()> {
    expect_that!(CanonicalKey::try_from(input), err(anything()));
    expect_that!(CanonicalKey::try_from(input.to_string()), err(anything()));

    let input_json = serde_json::to_string(input)?;
    expect_that!(
        serde_json::from_str::<CanonicalKey>(&input_json),
        err(anything())
    );

    Ok(())
}

#[gtest]
fn test_configuration_id_rejects_separators() {
    expect_that!(ConfigurationId::try_from("crm-import"), ok(anything()));
    expect_that!(ConfigurationId::try_from(""), err(anything()));
    expect_that!(ConfigurationId::try_from("a/b"), err(anything()));
    expect_that!(ConfigurationId::try_from("a b"), err(anything()));
}

#[gtest]
fn test_pack_version_id_derive() -> anyhow::Result<()> {
    let id = PackVersionId::derive(
        &ConfigurationId::try_from("contacts")?,
        &CanonicalKey::try_from("full_name")?,
        3,
    );
    expect_that!(id.as_str(), eq("contacts/full_name@3"));
    Ok(())
}

#[gtest]
fn test_column_binding_deserialize_defaults() -> anyhow::Result<()> {
    let binding: ColumnBinding = serde_json::from_str(r#"{"canonical_key": "email", "ordinal": 2}"#)?;

    expect_that!(
        binding,
        eq(&ColumnBinding::new(CanonicalKey::try_from("email")?, 2))
    );
    expect_that!(binding.enabled, eq(true));
    Ok(())
}
