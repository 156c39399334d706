//! EIP-1559 transactions carrying an ERC-20 `transfer`.
//!
//! ```text
//! signing_payload = 0x02 || rlp([chain_id, nonce, max_priority_fee_per_gas,
//!                                max_fee_per_gas, gas_limit, to, value, data,
//!                                access_list])
//! raw             = 0x02 || rlp([..., y_parity, r, s])
//! tx_hash         = keccak256(raw)
//! ```

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_rlp::{Decodable, Encodable, Header};

use crate::error::{ChainError, ChainResult};

pub const EIP1559_TX_TYPE: u8 = 0x02;

/// `transfer(address,uint256)`
pub const ERC20_TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// Unsigned type-2 transaction. The access list is always empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eip1559Transaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub max_priority_fee_per_gas: u128,
    pub max_fee_per_gas: u128,
    pub gas_limit: u64,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

/// Secp256k1 signature over [`Eip1559Transaction::signing_hash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSignature {
    pub r: U256,
    pub s: U256,
    pub y_parity: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Bytes,
    pub hash: B256,
}

impl SignedTransaction {
    pub fn hash_hex(&self) -> String {
        format!("0x{}", hex::encode(self.hash))
    }
}

impl Eip1559Transaction {
    fn fields_len(&self) -> usize {
        self.chain_id.length()
            + self.nonce.length()
            + self.max_priority_fee_per_gas.length()
            + self.max_fee_per_gas.length()
            + self.gas_limit.length()
            + self.to.length()
            + self.value.length()
            + self.data.length()
            + empty_list_len()
    }

    fn encode_fields(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.chain_id.encode(out);
        self.nonce.encode(out);
        self.max_priority_fee_per_gas.encode(out);
        self.max_fee_per_gas.encode(out);
        self.gas_limit.encode(out);
        self.to.encode(out);
        self.value.encode(out);
        self.data.encode(out);
        Header {
            list: true,
            payload_length: 0,
        }
        .encode(out);
    }

    /// Bytes whose keccak256 is signed.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.fields_len() + 8);
        out.push(EIP1559_TX_TYPE);
        Header {
            list: true,
            payload_length: self.fields_len(),
        }
        .encode(&mut out);
        self.encode_fields(&mut out);
        out
    }

    pub fn signing_hash(&self) -> B256 {
        keccak256(self.signing_payload())
    }

    /// Attach a signature and produce the broadcastable envelope.
    pub fn into_signed(self, signature: TxSignature) -> SignedTransaction {
        let y_parity = u64::from(signature.y_parity);
        let payload_length =
            self.fields_len() + y_parity.length() + signature.r.length() + signature.s.length();

        let mut out = Vec::with_capacity(payload_length + 8);
        out.push(EIP1559_TX_TYPE);
        Header {
            list: true,
            payload_length,
        }
        .encode(&mut out);
        self.encode_fields(&mut out);
        y_parity.encode(&mut out);
        signature.r.encode(&mut out);
        signature.s.encode(&mut out);

        let hash = keccak256(&out);
        SignedTransaction {
            raw: Bytes::from(out),
            hash,
        }
    }

    /// Decode a signed type-2 envelope.
    pub fn decode_signed(raw: &[u8]) -> ChainResult<(Self, TxSignature)> {
        let invalid = |e: alloy_rlp::Error| ChainError::BroadcastRejected {
            message: format!("rlp: {}", e),
        };

        let (ty, mut buf) = raw.split_first().ok_or_else(|| ChainError::BroadcastRejected {
            message: "empty transaction".to_string(),
        })?;
        if *ty != EIP1559_TX_TYPE {
            return Err(ChainError::BroadcastRejected {
                message: format!("unsupported transaction type {:#04x}", ty),
            });
        }

        let header = Header::decode(&mut buf).map_err(invalid)?;
        if !header.list {
            return Err(ChainError::BroadcastRejected {
                message: "transaction is not an rlp list".to_string(),
            });
        }

        let tx = Self {
            chain_id: u64::decode(&mut buf).map_err(invalid)?,
            nonce: u64::decode(&mut buf).map_err(invalid)?,
            max_priority_fee_per_gas: u128::decode(&mut buf).map_err(invalid)?,
            max_fee_per_gas: u128::decode(&mut buf).map_err(invalid)?,
            gas_limit: u64::decode(&mut buf).map_err(invalid)?,
            to: Address::decode(&mut buf).map_err(invalid)?,
            value: U256::decode(&mut buf).map_err(invalid)?,
            data: Bytes::decode(&mut buf).map_err(invalid)?,
        };

        let access_list = Header::decode(&mut buf).map_err(invalid)?;
        if !access_list.list || access_list.payload_length > buf.len() {
            return Err(ChainError::BroadcastRejected {
                message: "invalid access list".to_string(),
            });
        }
        buf = &buf[access_list.payload_length..];

        let signature = TxSignature {
            y_parity: u64::decode(&mut buf).map_err(invalid)? == 1,
            r: U256::decode(&mut buf).map_err(invalid)?,
            s: U256::decode(&mut buf).map_err(invalid)?,
        };
        Ok((tx, signature))
    }
}

fn empty_list_len() -> usize {
    1
}

/// `transfer(to, amount)` calldata, followed by the 32-byte audit hash when
/// the payment carries one.
pub fn erc20_transfer_calldata(to: Address, amount: U256, audit_hash: Option<B256>) -> Bytes {
    let mut data = Vec::with_capacity(4 + 32 * 3);
    data.extend_from_slice(&ERC20_TRANSFER_SELECTOR);
    data.extend_from_slice(B256::left_padding_from(to.as_slice()).as_slice());
    data.extend_from_slice(&amount.to_be_bytes::<32>());
    if let Some(hash) = audit_hash {
        data.extend_from_slice(hash.as_slice());
    }
    Bytes::from(data)
}

/// Scale an amount in fiat minor units to token base units.
///
/// `1050` cents of a 6-decimal token is `10_500_000`.
pub fn minor_to_base_units(amount_minor: u64, decimals: u8, minor_decimals: u8) -> ChainResult<U256> {
    let shift = decimals
        .checked_sub(minor_decimals)
        .ok_or_else(|| ChainError::Config {
            message: format!(
                "token decimals {} below minor-unit decimals {}",
                decimals, minor_decimals
            ),
        })?;
    U256::from(10u64)
        .checked_pow(U256::from(shift))
        .and_then(|scale| U256::from(amount_minor).checked_mul(scale))
        .ok_or_else(|| ChainError::InvalidPayment {
            message: "amount overflows token units".to_string(),
        })
}

/// Parse a `0x`-prefixed 32-byte hex digest.
pub fn parse_audit_hash(s: &str) -> ChainResult<B256> {
    s.parse::<B256>().map_err(|e| ChainError::InvalidPayment {
        message: format!("audit_hash must be 32 bytes of hex: {}", e),
    })
}

/// Ethereum address of a secp256k1 public key.
pub fn address_of(key: &k256::ecdsa::VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

/// Recover the sender of a signed transaction.
pub fn recover_sender(tx: &Eip1559Transaction, signature: &TxSignature) -> ChainResult<Address> {
    let invalid = |message: String| ChainError::BroadcastRejected { message };

    let mut bytes = [0u8; 64];
    bytes[..32].copy_from_slice(&signature.r.to_be_bytes::<32>());
    bytes[32..].copy_from_slice(&signature.s.to_be_bytes::<32>());
    let sig = k256::ecdsa::Signature::from_slice(&bytes).map_err(|e| invalid(e.to_string()))?;
    let recid = k256::ecdsa::RecoveryId::new(signature.y_parity, false);

    let key = k256::ecdsa::VerifyingKey::recover_from_prehash(
        tx.signing_hash().as_slice(),
        &sig,
        recid,
    )
    .map_err(|e| invalid(e.to_string()))?;
    Ok(address_of(&key))
}
