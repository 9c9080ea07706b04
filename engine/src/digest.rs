//! Content addressing of pack code.

use std::io::Write;

use anyhow::{Context, Result};

type HashAlgo = sha::sha256::Sha256;

/// Returns the lowercase hex SHA-256 digest of `code`.
pub fn code_digest(code: &str) -> Result<String> {
    let mut hash = HashAlgo::default();
    hash.write_all(code.as_bytes())
        .context("hashing pack code")?;
    hash.flush().context("flushing hash")?;
    Ok(hex::encode(sha::utils::DigestExt::to_bytes(&mut hash)))
}

/// True if `digest` is the digest of `code`. Comparison ignores hex letter case.
pub fn digest_matches(code: &str, digest: &str) -> Result<bool> {
    Ok(code_digest(code)?.eq_ignore_ascii_case(digest))
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use super::*;

    #[gtest]
    fn test_code_digest_known_value() -> anyhow::Result<()> {
        expect_that!(
            code_digest("")?,
            eq("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
        );
        expect_that!(
            code_digest("abc")?,
            eq("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        Ok(())
    }

    #[gtest]
    fn test_digest_matches() -> anyhow::Result<()> {
        let digest = code_digest("function detect_x() {}")?;

        expect_that!(digest_matches("function detect_x() {}", &digest)?, eq(true));
        expect_that!(
            digest_matches("function detect_x() {}", &digest.to_uppercase())?,
            eq(true)
        );
        expect_that!(digest_matches("function detect_y() {}", &digest)?, eq(false));
        Ok(())
    }
}
