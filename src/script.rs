//! Script verification seam and a standard pay-to-pubkey(-hash) verifier

use crate::types::*;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};

const OP_0: u8 = 0x00;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_1NEGATE: u8 = 0x4f;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_NOP: u8 = 0x61;
const OP_VERIFY: u8 = 0x69;
const OP_RETURN: u8 = 0x6a;
const OP_DROP: u8 = 0x75;
const OP_DUP: u8 = 0x76;
const OP_SWAP: u8 = 0x7c;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_HASH160: u8 = 0xa9;
const OP_HASH256: u8 = 0xaa;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKSIGVERIFY: u8 = 0xad;

const SIGHASH_NONE: u32 = 2;
const SIGHASH_SINGLE: u32 = 3;
const SIGHASH_ANYONECANPAY: u32 = 0x80;

const MAX_STACK_SIZE: usize = 1000;
const MAX_SCRIPT_OPS: usize = 201;

/// Decides whether an unlocking script satisfies a locking script.
///
/// Implementations must be pure with respect to chain state.
pub trait ScriptVerifier: Send + Sync {
    fn verify(
        &self,
        script_sig: &[u8],
        script_pubkey: &[u8],
        tx: &Transaction,
        input_index: usize,
        hash_type: u32,
    ) -> bool;
}

/// Accepts every script. For trusted history and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllVerifier;

impl ScriptVerifier for AcceptAllVerifier {
    fn verify(&self, _: &[u8], _: &[u8], _: &Transaction, _: usize, _: u32) -> bool {
        true
    }
}

/// Evaluates the legacy stack language subset used by pay-to-pubkey and
/// pay-to-pubkey-hash outputs.
///
/// Each signature carries its own sighash byte, which is what gets verified;
/// the `hash_type` requested by the caller is not consulted.
pub struct StandardScriptVerifier {
    secp: Secp256k1<VerifyOnly>,
}

impl Default for StandardScriptVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl StandardScriptVerifier {
    pub fn new() -> Self {
        StandardScriptVerifier {
            secp: Secp256k1::verification_only(),
        }
    }

    /// EvalScript: 𝒮𝒞 × 𝒮𝒯 → {true, false}
    ///
    /// Runs `script` against `stack`. Returns false on any failed VERIFY,
    /// unsupported opcode, stack underflow, or exceeded limit.
    pub fn eval(
        &self,
        script: &[u8],
        stack: &mut Vec<ByteString>,
        tx: &Transaction,
        input_index: usize,
        script_code: &[u8],
    ) -> bool {
        let ops = match parse_script(script) {
            Some(ops) => ops,
            None => return false,
        };
        if ops.iter().filter(|op| matches!(op, ScriptOp::Op(_))).count() > MAX_SCRIPT_OPS {
            return false;
        }

        for op in ops {
            let ok = match op {
                ScriptOp::Push(data) => {
                    stack.push(data);
                    true
                }
                ScriptOp::Op(opcode) => {
                    self.execute_opcode(opcode, stack, tx, input_index, script_code)
                }
            };
            if !ok || stack.len() > MAX_STACK_SIZE {
                return false;
            }
        }
        true
    }

    fn execute_opcode(
        &self,
        opcode: u8,
        stack: &mut Vec<ByteString>,
        tx: &Transaction,
        input_index: usize,
        script_code: &[u8],
    ) -> bool {
        match opcode {
            OP_1NEGATE => {
                stack.push(vec![0x81]);
                true
            }
            OP_1..=OP_16 => {
                stack.push(vec![opcode - (OP_1 - 1)]);
                true
            }
            OP_NOP => true,
            OP_VERIFY => matches!(stack.pop(), Some(item) if cast_to_bool(&item)),
            OP_RETURN => false,
            OP_DROP => stack.pop().is_some(),
            OP_DUP => match stack.last().cloned() {
                Some(item) => {
                    stack.push(item);
                    true
                }
                None => false,
            },
            OP_SWAP => {
                let len = stack.len();
                if len < 2 {
                    return false;
                }
                stack.swap(len - 1, len - 2);
                true
            }
            OP_EQUAL | OP_EQUALVERIFY => {
                let (Some(a), Some(b)) = (stack.pop(), stack.pop()) else {
                    return false;
                };
                if opcode == OP_EQUALVERIFY {
                    return a == b;
                }
                stack.push(if a == b { vec![1] } else { vec![] });
                true
            }
            OP_HASH160 => match stack.pop() {
                Some(item) => {
                    stack.push(hash160(&item).to_vec());
                    true
                }
                None => false,
            },
            OP_HASH256 => match stack.pop() {
                Some(item) => {
                    stack.push(double_sha256(&item).to_vec());
                    true
                }
                None => false,
            },
            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                let (Some(pubkey), Some(signature)) = (stack.pop(), stack.pop()) else {
                    return false;
                };
                let valid = self.check_signature(&signature, &pubkey, tx, input_index, script_code);
                if opcode == OP_CHECKSIGVERIFY {
                    return valid;
                }
                stack.push(if valid { vec![1] } else { vec![] });
                true
            }
            _ => false,
        }
    }

    fn check_signature(
        &self,
        signature: &[u8],
        pubkey: &[u8],
        tx: &Transaction,
        input_index: usize,
        script_code: &[u8],
    ) -> bool {
        let Some((&hash_byte, der)) = signature.split_last() else {
            return false;
        };
        let pubkey = match PublicKey::from_slice(pubkey) {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        let mut signature = match Signature::from_der(der) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        signature.normalize_s();

        let digest = signature_hash(tx, input_index, script_code, hash_byte as u32);
        let message = match Message::from_digest_slice(&digest) {
            Ok(message) => message,
            Err(_) => return false,
        };
        self.secp.verify_ecdsa(&message, &signature, &pubkey).is_ok()
    }
}

impl ScriptVerifier for StandardScriptVerifier {
    fn verify(
        &self,
        script_sig: &[u8],
        script_pubkey: &[u8],
        tx: &Transaction,
        input_index: usize,
        _hash_type: u32,
    ) -> bool {
        if input_index >= tx.inputs.len() {
            return false;
        }

        let mut stack = Vec::new();
        if !self.eval(script_sig, &mut stack, tx, input_index, script_pubkey) {
            return false;
        }
        if !self.eval(script_pubkey, &mut stack, tx, input_index, script_pubkey) {
            return false;
        }
        stack.last().map_or(false, |top| cast_to_bool(top))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScriptOp {
    Push(ByteString),
    Op(u8),
}

/// Split a script into pushes and opcodes. `None` if a push runs past the end.
fn parse_script(script: &[u8]) -> Option<Vec<ScriptOp>> {
    let mut ops = Vec::new();
    let mut pos = 0;

    while pos < script.len() {
        let opcode = script[pos];
        pos += 1;

        let len = match opcode {
            OP_0 => 0,
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => {
                let n = *script.get(pos)? as usize;
                pos += 1;
                n
            }
            OP_PUSHDATA2 => {
                let bytes = script.get(pos..pos + 2)?;
                pos += 2;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let bytes = script.get(pos..pos + 4)?;
                pos += 4;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            _ => {
                ops.push(ScriptOp::Op(opcode));
                continue;
            }
        };

        let data = script.get(pos..pos.checked_add(len)?)?;
        ops.push(ScriptOp::Push(data.to_vec()));
        pos += len;
    }

    Some(ops)
}

/// Script truthiness: any non-zero byte, except a lone sign bit in the last byte.
fn cast_to_bool(item: &[u8]) -> bool {
    for (i, &byte) in item.iter().enumerate() {
        if byte != 0 {
            return !(i == item.len() - 1 && byte == 0x80);
        }
    }
    false
}

/// SignatureHash
///
/// Legacy (pre-segwit) digest committed to by a signature on input
/// `input_index`:
/// 1. Blank every scriptSig, put `script_code` in the signed input
/// 2. NONE: drop all outputs; SINGLE: keep outputs up to the input's index,
///    blanking earlier ones. Both zero the other inputs' sequences
/// 3. ANYONECANPAY: keep only the signed input
/// 4. Append `hash_type` as 4 LE bytes and double-SHA256
///
/// SINGLE without a matching output signs the number one, as Bitcoin does.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    hash_type: u32,
) -> Hash {
    let mut one = [0u8; 32];
    one[0] = 1;
    if input_index >= tx.inputs.len() {
        return one;
    }

    let base_type = hash_type & 0x1f;
    if base_type == SIGHASH_SINGLE && input_index >= tx.outputs.len() {
        return one;
    }

    let mut copy = tx.clone();
    for (i, input) in copy.inputs.iter_mut().enumerate() {
        input.script_sig = if i == input_index {
            script_code.to_vec()
        } else {
            Vec::new()
        };
    }

    if base_type == SIGHASH_NONE || base_type == SIGHASH_SINGLE {
        if base_type == SIGHASH_NONE {
            copy.outputs.clear();
        } else {
            copy.outputs.truncate(input_index + 1);
            for output in copy.outputs.iter_mut().take(input_index) {
                output.value = u64::MAX;
                output.script_pubkey.clear();
            }
        }
        for (i, input) in copy.inputs.iter_mut().enumerate() {
            if i != input_index {
                input.sequence = 0;
            }
        }
    }

    if hash_type & SIGHASH_ANYONECANPAY != 0 {
        copy.inputs = vec![copy.inputs[input_index].clone()];
    }

    let mut data = copy.serialize();
    data.extend_from_slice(&hash_type.to_le_bytes());
    double_sha256(&data)
}

/// Pubkey hash a locking script pays to: the embedded hash of a P2PKH script,
/// or the hash160 of a P2PK script's key.
pub fn extract_pubkey_hash(script_pubkey: &[u8]) -> Option<PubKeyHash> {
    match script_pubkey {
        [OP_DUP, OP_HASH160, 0x14, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG] if hash.len() == 20 => {
            let mut out = [0u8; 20];
            out.copy_from_slice(hash);
            Some(out)
        }
        [len, key @ .., OP_CHECKSIG]
            if (*len == 33 || *len == 65) && key.len() == *len as usize =>
        {
            Some(hash160(key))
        }
        _ => None,
    }
}

/// Standard pay-to-pubkey-hash locking script.
pub fn p2pkh_script(pubkey_hash: &PubKeyHash) -> ByteString {
    let mut script = vec![OP_DUP, OP_HASH160, 0x14];
    script.extend_from_slice(pubkey_hash);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}
