//! CRC helper tool (spec.md §6, "CRC helper tool", bundled secondary
//! utility): computes the filesystem's seeded CRC32C of a string, or
//! brute-forces short printable-ASCII strings matching a target CRC.

use clap::{Parser, Subcommand};

use btrfsdump::wire::crc32c_seeded;

/// The filesystem's canonical checksum seed: bitwise complement of 1.
const DEFAULT_SEED: u32 = !1u32;

#[derive(Parser)]
#[command(name = "btrfs-crc", about = "Compute or brute-force the filesystem's seeded CRC32C")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the CRC32C of a string.
    Hash {
        value: String,
        #[arg(long, default_value_t = DEFAULT_SEED)]
        seed: u32,
    },
    /// Brute-force printable ASCII strings of `length` starting at `seed`
    /// until one matches `target`.
    Brute {
        #[arg(long)]
        length: usize,
        #[arg(long)]
        target: u32,
        #[arg(long, default_value_t = DEFAULT_SEED)]
        seed: u32,
    },
}

fn main() {
    match Cli::parse().command {
        Command::Hash { value, seed } => {
            println!("{:08x}", crc32c_seeded(value.as_bytes(), seed));
        }
        Command::Brute { length, target, seed } => match brute_force(length, target, seed) {
            Some(found) => println!("{found}"),
            None => {
                eprintln!("no match found");
                std::process::exit(1);
            }
        },
    }
}

/// Printable ASCII range used by the search, excluding `/` (0x2F) and the
/// terminating byte 127 (DEL) per spec.md §6.
fn candidate_bytes() -> Vec<u8> {
    (0x20u8..0x7F).filter(|&b| b != b'/').collect()
}

/// `seed` is accepted for CLI symmetry with `hash`, but the search itself
/// always hashes with the canonical `DEFAULT_SEED`: the original tool's `-s`
/// only feeds an `srand()` call its search loop never consumes, so its
/// brute force is seed-invariant (spec.md §8 scenario 6 relies on this —
/// it brute-forces with seed 0 against a target computed with `!1`).
fn brute_force(length: usize, target: u32, _seed: u32) -> Option<String> {
    let alphabet = candidate_bytes();
    let mut indices = vec![0usize; length];
    let base = alphabet.len();

    loop {
        let candidate: Vec<u8> = indices.iter().map(|&i| alphabet[i]).collect();
        if crc32c_seeded(&candidate, DEFAULT_SEED) == target {
            return String::from_utf8(candidate).ok();
        }

        let mut pos = length;
        loop {
            if pos == 0 {
                return None;
            }
            pos -= 1;
            indices[pos] += 1;
            if indices[pos] < base {
                break;
            }
            indices[pos] = 0;
        }
    }
}
