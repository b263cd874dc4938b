use crate::errors::{ConfigurationError, ExternalServiceError, LotteryResult, ValidationError};
use chrono::{DateTime, Utc};
use schnorrkel::vrf::{VRFPreOut, VRFProof};
use schnorrkel::{signing_context, ExpansionMode, Keypair, MiniSecretKey, PublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

const VRF_SIGNING_CONTEXT: &[u8] = b"survival-lottery";
const VRF_OUTPUT_CONTEXT: &[u8] = b"survival-lottery-draw";

/// What a draw is used for; part of every seed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DrawPurpose {
    Prize,
    Assignment,
    Elimination,
}

impl fmt::Display for DrawPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrawPurpose::Prize => write!(f, "prize"),
            DrawPurpose::Assignment => write!(f, "assignment"),
            DrawPurpose::Elimination => write!(f, "elimination"),
        }
    }
}

/// Seed binding a draw to one game, purpose, round and counter value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawSeed {
    pub game_id: String,
    pub purpose: DrawPurpose,
    pub round: u32,
    pub counter: u64,
}

impl fmt::Display for DrawSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.game_id, self.purpose, self.round, self.counter)
    }
}

/// Result of one verifiable draw
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VRFResult {
    /// Uniform integer in the requested range
    pub value: u64,
    /// Hex-encoded VRF output (32 bytes)
    pub random_bytes: String,
    /// Hex-encoded VRF pre-output followed by the proof (32 + 64 bytes)
    pub proof: String,
    /// Hex-encoded public key (32 bytes)
    pub public_key: String,
    /// Input message used for VRF
    pub input_message: String,
    pub timestamp: DateTime<Utc>,
}

/// Source of verifiable randomness for every game draw
pub trait RandomnessSource: Send + Sync {
    /// Uniform integer in `[min, max]` plus a proof bound to `seed`
    fn draw(&self, min: u64, max: u64, seed: &DrawSeed) -> LotteryResult<VRFResult>;
}

/// VRF-based draw generator
pub struct VRFGameEngine {
    keypair: Arc<Keypair>,
}

impl VRFGameEngine {
    /// Create a new VRF engine with a keypair
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair: Arc::new(keypair),
        }
    }

    /// Create a new VRF engine with a random keypair (for testing)
    pub fn new_random() -> Self {
        use rand_core::OsRng;
        let keypair = Keypair::generate_with(OsRng);
        Self::new(keypair)
    }

    /// Derive the keypair from a hex-encoded 32-byte mini secret key
    pub fn from_secret_hex(secret_hex: &str) -> LotteryResult<Self> {
        let bytes = hex::decode(secret_hex.trim()).map_err(|e| ConfigurationError::InvalidValue {
            field: "randomness.secret_key_hex".to_string(),
            value: "<redacted>".to_string(),
            reason: format!("invalid hex: {}", e),
        })?;
        let mini = MiniSecretKey::from_bytes(&bytes).map_err(|e| ConfigurationError::InvalidValue {
            field: "randomness.secret_key_hex".to_string(),
            value: "<redacted>".to_string(),
            reason: format!("invalid VRF secret: {:?}", e),
        })?;
        Ok(Self::new(mini.expand_to_keypair(ExpansionMode::Ed25519)))
    }

    /// Build from configuration, falling back to an ephemeral key when allowed
    pub fn from_config(config: &crate::config::RandomnessConfig) -> LotteryResult<Self> {
        match config.secret_key_hex {
            Some(ref secret) => Self::from_secret_hex(secret),
            None if config.require_secret => {
                Err(ConfigurationError::MissingRequired("randomness.secret_key_hex".to_string()).into())
            }
            None => {
                tracing::warn!("No VRF secret configured, using an ephemeral key; proofs will not survive a restart");
                Ok(Self::new_random())
            }
        }
    }

    /// Sign `message` and return (output, pre-output ‖ proof)
    fn vrf_sign(&self, message: &[u8]) -> ([u8; 32], Vec<u8>) {
        let ctx = signing_context(VRF_SIGNING_CONTEXT);
        let (inout, proof, _) = self.keypair.vrf_sign(ctx.bytes(message));

        let output: [u8; 32] = inout.make_bytes(VRF_OUTPUT_CONTEXT);

        let mut proof_bytes = Vec::with_capacity(96);
        proof_bytes.extend_from_slice(&inout.to_preout().to_bytes());
        proof_bytes.extend_from_slice(&proof.to_bytes());

        (output, proof_bytes)
    }

    /// Verify a draw against the seed and range it claims to answer
    pub fn verify_draw(result: &VRFResult, min: u64, max: u64, seed: &DrawSeed) -> Result<bool, String> {
        let expected_input = seed.to_string();
        if result.input_message != expected_input {
            return Ok(false);
        }

        let proof_bytes = hex::decode(&result.proof).map_err(|e| format!("Invalid VRF proof hex: {}", e))?;
        if proof_bytes.len() != 96 {
            return Err("VRF proof must be 96 bytes".to_string());
        }
        let public_key_bytes =
            hex::decode(&result.public_key).map_err(|e| format!("Invalid public key hex: {}", e))?;

        let public_key =
            PublicKey::from_bytes(&public_key_bytes).map_err(|e| format!("Invalid public key: {:?}", e))?;
        let preout =
            VRFPreOut::from_bytes(&proof_bytes[..32]).map_err(|e| format!("Invalid VRF pre-output: {:?}", e))?;
        let proof = VRFProof::from_bytes(&proof_bytes[32..]).map_err(|e| format!("Invalid VRF proof: {:?}", e))?;

        let ctx = signing_context(VRF_SIGNING_CONTEXT);
        let inout = match public_key.vrf_verify(ctx.bytes(expected_input.as_bytes()), &preout, &proof) {
            Ok((inout, _)) => inout,
            Err(_) => return Ok(false),
        };

        let output: [u8; 32] = inout.make_bytes(VRF_OUTPUT_CONTEXT);
        if hex::encode(output) != result.random_bytes {
            return Ok(false);
        }

        Ok(derive_in_range(&output, min, max) == Some(result.value))
    }

    /// Get the public key as hex string
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.public.to_bytes())
    }
}

impl RandomnessSource for VRFGameEngine {
    fn draw(&self, min: u64, max: u64, seed: &DrawSeed) -> LotteryResult<VRFResult> {
        if min > max {
            return Err(ValidationError::InvalidRange { min, max }.into());
        }

        let input_message = seed.to_string();
        let (output, proof) = self.vrf_sign(input_message.as_bytes());
        let value = derive_in_range(&output, min, max).ok_or_else(|| {
            ExternalServiceError::Randomness(format!("rejection sampling exhausted for seed {}", input_message))
        })?;

        Ok(VRFResult {
            value,
            random_bytes: hex::encode(output),
            proof: hex::encode(proof),
            public_key: self.public_key_hex(),
            input_message,
            timestamp: Utc::now(),
        })
    }
}

/// Map VRF output to a uniform integer in `[min, max]` without modulo bias.
///
/// The output is stretched with SHA-256 over a block counter and each 8-byte
/// word is rejected when it falls in the biased tail.
fn derive_in_range(output: &[u8; 32], min: u64, max: u64) -> Option<u64> {
    if min > max {
        return None;
    }
    let span = match (max - min).checked_add(1) {
        Some(span) => span,
        None => return Some(u64::from_le_bytes(first_word(output))),
    };
    let zone = u64::MAX - (u64::MAX % span);

    for block in 0u32..64 {
        let mut hasher = Sha256::new();
        hasher.update(output);
        hasher.update(block.to_le_bytes());
        let digest = hasher.finalize();

        for chunk in digest.chunks_exact(8) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            let candidate = u64::from_le_bytes(word);
            if candidate < zone {
                return Some(min + candidate % span);
            }
        }
    }

    None
}

fn first_word(output: &[u8; 32]) -> [u8; 8] {
    let mut word = [0u8; 8];
    word.copy_from_slice(&output[..8]);
    word
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(counter: u64) -> DrawSeed {
        DrawSeed {
            game_id: "test-game-123".to_string(),
            purpose: DrawPurpose::Elimination,
            round: 1,
            counter,
        }
    }

    #[test]
    fn test_draw_generation_and_verification() {
        let engine = VRFGameEngine::new_random();

        let result = engine.draw(1, 40, &seed(7)).expect("VRF draw failed");
        assert!((1..=40).contains(&result.value));
        assert_eq!(result.input_message, "test-game-123:elimination:1:7");

        let is_valid = VRFGameEngine::verify_draw(&result, 1, 40, &seed(7)).expect("Verification failed");
        assert!(is_valid, "VRF proof should be valid");
    }

    #[test]
    fn test_same_secret_same_output() {
        let secret = hex::encode([7u8; 32]);
        let a = VRFGameEngine::from_secret_hex(&secret).expect("key");
        let b = VRFGameEngine::from_secret_hex(&secret).expect("key");

        let ra = a.draw(1, 1_000_000, &seed(1)).expect("draw");
        let rb = b.draw(1, 1_000_000, &seed(1)).expect("draw");

        assert_eq!(ra.value, rb.value);
        assert_eq!(ra.random_bytes, rb.random_bytes);
        assert_eq!(a.public_key_hex(), b.public_key_hex());
    }

    #[test]
    fn test_tamper_detection() {
        let engine = VRFGameEngine::new_random();
        let mut result = engine.draw(1, 100, &seed(1)).expect("draw");

        result.random_bytes = hex::encode([0xffu8; 32]);
        let is_valid = VRFGameEngine::verify_draw(&result, 1, 100, &seed(1)).expect("Verification failed");
        assert!(!is_valid, "Tampered VRF should be invalid");

        let fresh = engine.draw(1, 100, &seed(1)).expect("draw");
        let is_valid = VRFGameEngine::verify_draw(&fresh, 1, 100, &seed(2)).expect("Verification failed");
        assert!(!is_valid, "Proof must be bound to its seed");
    }

    #[test]
    fn test_single_value_range() {
        let engine = VRFGameEngine::new_random();
        let result = engine.draw(5, 5, &seed(1)).expect("draw");
        assert_eq!(result.value, 5);
    }

    #[test]
    fn test_inverted_range_rejected() {
        let engine = VRFGameEngine::new_random();
        assert!(engine.draw(10, 1, &seed(1)).is_err());
    }

    #[test]
    fn test_derived_values_cover_small_range() {
        let engine = VRFGameEngine::new_random();
        let mut seen = [false; 4];
        for counter in 0..200 {
            let result = engine.draw(0, 3, &seed(counter)).expect("draw");
            seen[result.value as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }
}
