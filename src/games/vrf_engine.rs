use crate::errors::{CrashResult, StoreError};
use crate::games::crash_point::{CrashCurve, CrashDraw, CrashPointSource};
use crate::games::types::{FairnessProof, RoundId};
use crate::storage::RocksStorage;
use schnorrkel::{Keypair, PublicKey, Signature};
use sha2::{Digest, Sha256};
use std::sync::Arc;

const VRF_SIGNING_CONTEXT: &[u8] = b"substrate";
const VRF_SEED_KEY: &[u8] = b"vrf:mini_secret_seed";

/// Provably fair crash point source backed by a schnorrkel VRF
pub struct VrfCrashSource {
    keypair: Arc<Keypair>,
    curve: CrashCurve,
}

impl VrfCrashSource {
    pub fn new(keypair: Keypair, curve: CrashCurve) -> Self {
        Self {
            keypair: Arc::new(keypair),
            curve,
        }
    }

    /// Create a source with a random keypair (for testing and in-memory runs)
    pub fn new_random(curve: CrashCurve) -> Self {
        use rand_core::OsRng;
        Self::new(Keypair::generate_with(OsRng), curve)
    }

    /// Load the persisted key, creating and storing one on first start
    pub fn load_or_create(storage: &RocksStorage, curve: CrashCurve) -> CrashResult<Self> {
        Ok(Self::new(load_or_create_vrf_keypair(storage)?, curve))
    }

    /// Input message signed for a round
    pub fn round_message(round_id: RoundId) -> String {
        format!("crash:round:{}", round_id)
    }

    /// Sign the round message and derive the crash point from the output
    pub fn prove(&self, round_id: RoundId) -> CrashDraw {
        use schnorrkel::context::SigningContext;

        let input_message = Self::round_message(round_id);
        let ctx = SigningContext::new(VRF_SIGNING_CONTEXT);
        let signature = self.keypair.sign(ctx.bytes(input_message.as_bytes()));

        // VRF output is the hash of the signature
        let signature_bytes = signature.to_bytes();
        let vrf_output = Sha256::digest(signature_bytes);

        CrashDraw {
            multiplier: crash_point_from_output(vrf_output.as_slice(), &self.curve),
            proof: Some(FairnessProof {
                input_message,
                vrf_output: hex::encode(vrf_output),
                vrf_proof: hex::encode(signature_bytes),
                public_key: self.public_key_hex(),
            }),
        }
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.public.to_bytes())
    }
}

impl CrashPointSource for VrfCrashSource {
    fn draw(&mut self, round_id: RoundId) -> CrashResult<CrashDraw> {
        Ok(self.prove(round_id))
    }
}

/// Map VRF output bytes to the two curve uniforms and the multiplier
pub fn crash_point_from_output(vrf_output: &[u8], curve: &CrashCurve) -> f64 {
    let atom = unit_interval(vrf_output.get(0..8));
    let tail = unit_interval(vrf_output.get(8..16));
    curve.multiplier_from_uniforms(atom, tail)
}

// Top 53 bits of a big-endian u64 scaled onto [0, 1)
fn unit_interval(bytes: Option<&[u8]>) -> f64 {
    let mut buf = [0u8; 8];
    if let Some(bytes) = bytes {
        buf.copy_from_slice(bytes);
    }
    (u64::from_be_bytes(buf) >> 11) as f64 / (1u64 << 53) as f64
}

/// Check the proof signature and that the output derives from it
pub fn verify_fairness_proof(proof: &FairnessProof, expected_input: &str) -> Result<bool, String> {
    if proof.input_message != expected_input {
        return Ok(false);
    }

    let vrf_output =
        hex::decode(&proof.vrf_output).map_err(|e| format!("Invalid VRF output hex: {}", e))?;
    let vrf_proof =
        hex::decode(&proof.vrf_proof).map_err(|e| format!("Invalid VRF proof hex: {}", e))?;
    let public_key_bytes =
        hex::decode(&proof.public_key).map_err(|e| format!("Invalid public key hex: {}", e))?;

    let public_key = PublicKey::from_bytes(&public_key_bytes)
        .map_err(|e| format!("Invalid public key: {:?}", e))?;
    let signature =
        Signature::from_bytes(&vrf_proof).map_err(|e| format!("Invalid signature: {:?}", e))?;

    use schnorrkel::context::SigningContext;
    let ctx = SigningContext::new(VRF_SIGNING_CONTEXT);
    if public_key
        .verify(ctx.bytes(expected_input.as_bytes()), &signature)
        .is_err()
    {
        return Ok(false);
    }

    let computed_output = Sha256::digest(&vrf_proof);
    Ok(computed_output.as_slice() == vrf_output.as_slice())
}

/// Recompute a round's crash point from its proof.
///
/// Returns `Ok(None)` when the proof does not verify.
pub fn verify_crash_point(
    proof: &FairnessProof,
    round_id: RoundId,
    curve: &CrashCurve,
) -> Result<Option<f64>, String> {
    if !verify_fairness_proof(proof, &VrfCrashSource::round_message(round_id))? {
        return Ok(None);
    }
    let output = hex::decode(&proof.vrf_output).map_err(|e| format!("Invalid VRF output hex: {}", e))?;
    Ok(Some(crash_point_from_output(&output, curve)))
}

fn load_or_create_vrf_keypair(storage: &RocksStorage) -> CrashResult<Keypair> {
    use schnorrkel::{ExpansionMode, MiniSecretKey};

    if let Some(existing) = storage.get(VRF_SEED_KEY)? {
        let seed: [u8; 32] = existing.try_into().map_err(|_| {
            StoreError::CorruptedData("VRF seed must be 32 bytes".to_string())
        })?;
        let mini = MiniSecretKey::from_bytes(&seed)
            .map_err(|e| StoreError::CorruptedData(format!("Invalid VRF seed: {:?}", e)))?;
        return Ok(mini.expand_to_keypair(ExpansionMode::Ed25519));
    }

    use rand_core::OsRng;
    let mini = MiniSecretKey::generate_with(OsRng);
    storage.put(VRF_SEED_KEY, &mini.to_bytes())?;
    tracing::info!("Generated new VRF key for crash point proofs");

    Ok(mini.expand_to_keypair(ExpansionMode::Ed25519))
}
