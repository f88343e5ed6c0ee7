use crate::fs::ensure_directory_exists;
use anyhow::{Context, Result};
use bitcoin::hashes::{sha256, Hash, HashEngine};
use pem::{encode, Pem};
use rand::Rng;
use std::{
    fmt,
    fs::{self, File},
    io::Write,
    path::Path,
};

pub const SEED_LENGTH: usize = 32;

/// The root secret every other key of the daemon is derived from.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Seed([u8; SEED_LENGTH]);

impl Seed {
    pub fn new_random<R: Rng>(mut rand: R) -> Result<Seed, rand::Error> {
        let mut arr = [0u8; SEED_LENGTH];
        rand.try_fill(&mut arr[..])?;
        Ok(Seed(arr))
    }

    pub fn random() -> Result<Seed, rand::Error> {
        Seed::new_random(rand::rngs::OsRng)
    }

    pub fn sha256_with_seed(&self, slices: &[&[u8]]) -> [u8; SEED_LENGTH] {
        let mut engine = sha256::HashEngine::default();
        engine.input(&self.0);
        for slice in slices {
            engine.input(slice);
        }

        sha256::Hash::from_engine(engine).into_inner()
    }

    /// Read the seed from `<data_dir>/seed.pem` if it exists, otherwise
    /// generate a random seed and write it there.
    pub fn from_file_or_generate(data_dir: &Path) -> Result<Seed> {
        let path = data_dir.join("seed.pem");

        if path.exists() {
            return Seed::from_file(&path);
        }

        tracing::info!("No seed file found, creating one at {}", path.display());

        let seed = Seed::random().context("could not generate a random seed")?;
        seed.write_to(&path)?;

        Ok(seed)
    }

    fn from_file(path: &Path) -> Result<Seed> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("could not read the seed file at {}", path.display()))?;
        let pem = pem::parse(contents)
            .with_context(|| format!("the seed file at {} is not PEM", path.display()))?;

        Seed::from_pem(pem)
    }

    fn from_pem(pem: Pem) -> Result<Seed> {
        anyhow::ensure!(
            pem.contents.len() == SEED_LENGTH,
            "expected {} bytes of seed, got {}",
            SEED_LENGTH,
            pem.contents.len()
        );

        let mut array = [0u8; SEED_LENGTH];
        array.copy_from_slice(&pem.contents);

        Ok(Seed(array))
    }

    fn write_to(&self, path: &Path) -> Result<()> {
        ensure_directory_exists(path)?;

        let pem = Pem {
            tag: String::from("SEED"),
            contents: self.0.to_vec(),
        };

        let mut file = File::create(path)
            .with_context(|| format!("could not create the seed file at {}", path.display()))?;
        file.write_all(encode(&pem).as_bytes())?;

        Ok(())
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seed([*****])")
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<[u8; 32]> for Seed {
    fn from(seed: [u8; 32]) -> Self {
        Seed(seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use tempfile::TempDir;

    #[test]
    fn seed_byte_string_must_be_32_bytes_long() {
        let _seed = Seed::from(*b"this string is exactly 32 bytes!");
    }

    #[test]
    fn data_and_seed_used_to_calculate_hash() {
        let seed1 = Seed::from(*b"hello world, you are beautiful!!");
        assert_ne!(
            seed1.sha256_with_seed(&[b"foo"]),
            seed1.sha256_with_seed(&[b"bar"])
        );

        let seed2 = Seed::from(*b"bye world, you are beautiful!!!!");
        assert_ne!(
            seed1.sha256_with_seed(&[b"foo"]),
            seed2.sha256_with_seed(&[b"foo"])
        );
    }

    #[test]
    fn two_random_seeds_are_different() {
        let random1 = Seed::new_random(OsRng).unwrap();
        let random2 = Seed::new_random(OsRng).unwrap();

        assert_ne!(random1, random2);
    }

    #[test]
    fn display_and_debug_are_redacted() {
        let seed = Seed::new_random(OsRng).unwrap();

        assert_eq!(seed.to_string(), "Seed([*****])".to_string());
        assert_eq!(format!("{:?}", seed), "Seed([*****])".to_string());
    }

    #[test]
    fn seed_from_pem_works() {
        let pem_string = "-----BEGIN SEED-----
syl9wSYaruvgxg9P5Q1qkZaq5YkM6GvXkxe+VYrL/XM=
-----END SEED-----
";

        let pem = pem::parse(pem_string).unwrap();
        let expected = pem.contents.clone();
        let got = Seed::from_pem(pem).unwrap();

        assert_eq!(&got.0[..], &expected[..]);
    }

    #[test]
    fn seed_from_pem_fails_for_short_seed() {
        let short = "-----BEGIN SEED-----
VnZUNFZ4dlY=
-----END SEED-----
";

        let pem = pem::parse(short).unwrap();

        assert!(Seed::from_pem(pem).is_err());
    }

    #[test]
    fn generate_then_reload_round_trips() {
        let data_dir = TempDir::new().unwrap();

        let generated = Seed::from_file_or_generate(data_dir.path()).unwrap();
        let reloaded = Seed::from_file_or_generate(data_dir.path()).unwrap();

        assert_eq!(generated, reloaded);
    }
}
