use std::fmt;

use thiserror::Error;

use super::{
    BlockCertification, BlockIdentity, BlockMembership, ProtocolParameters, Transaction,
};
use crate::crypto;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected field `{0}`")]
    MissingField(&'static str),
    #[error("expected section `{0}`")]
    MissingSection(&'static str),
    #[error("invalid value for field `{0}`")]
    BadValue(&'static str),
    #[error("malformed inline {0} record")]
    BadInlineRecord(&'static str),
    #[error("malformed parameters line")]
    BadParameters,
    #[error("unexpected end of document")]
    UnexpectedEnd,
    #[error("trailing content after the signature line")]
    TrailingContent,
}

/// Identifies a block by height and hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockStamp {
    pub number: u64,
    pub hash: String,
}

impl fmt::Display for BlockStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.number, self.hash)
    }
}

/// A block of the chain, either candidate or accepted.
///
/// The in-memory form mirrors the wire document exactly so that
/// serialize→parse→serialize is the identity on the raw form.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub version: u32,
    pub currency: String,
    pub number: u64,
    pub pow_min: usize,
    /// Issuer-declared time.
    pub time: u64,
    /// Median time, derived from the preceding blocks.
    pub median_time: u64,
    pub dividend: Option<u64>,
    pub ud_time: Option<u64>,
    pub issuer: String,
    pub previous_hash: Option<String>,
    pub previous_issuer: Option<String>,
    /// Raw `Parameters` value, present on the root block only.
    pub parameters: Option<String>,
    pub members_count: u64,
    pub monetary_mass: u64,
    pub identities: Vec<BlockIdentity>,
    pub joiners: Vec<BlockMembership>,
    pub actives: Vec<BlockMembership>,
    pub leavers: Vec<BlockMembership>,
    pub excluded: Vec<String>,
    pub certifications: Vec<BlockCertification>,
    pub transactions: Vec<Transaction>,
    pub nonce: u64,
    pub signature: String,
}

const SECTIONS: [&str; 7] = [
    "Identities:",
    "Joiners:",
    "Actives:",
    "Leavers:",
    "Excluded:",
    "Certifications:",
    "Transactions:",
];

impl Block {
    /// The part of the document covered by the issuer's signature,
    /// nonce included.
    pub fn signed_payload(&self) -> String {
        let mut out = String::with_capacity(512);
        out.push_str(&format!("Version: {}\n", self.version));
        out.push_str("Type: Block\n");
        out.push_str(&format!("Currency: {}\n", self.currency));
        out.push_str(&format!("Number: {}\n", self.number));
        out.push_str(&format!("PoWMin: {}\n", self.pow_min));
        out.push_str(&format!("Time: {}\n", self.time));
        out.push_str(&format!("MedianTime: {}\n", self.median_time));
        if let Some(ud) = self.dividend {
            out.push_str(&format!("UniversalDividend: {}\n", ud));
        }
        if let Some(ud_time) = self.ud_time {
            out.push_str(&format!("UDTime: {}\n", ud_time));
        }
        out.push_str(&format!("Issuer: {}\n", self.issuer));
        if let Some(previous_hash) = &self.previous_hash {
            out.push_str(&format!("PreviousHash: {}\n", previous_hash));
        }
        if let Some(previous_issuer) = &self.previous_issuer {
            out.push_str(&format!("PreviousIssuer: {}\n", previous_issuer));
        }
        if let Some(parameters) = &self.parameters {
            out.push_str(&format!("Parameters: {}\n", parameters));
        }
        out.push_str(&format!("MembersCount: {}\n", self.members_count));
        out.push_str(&format!("MonetaryMass: {}\n", self.monetary_mass));
        out.push_str("Identities:\n");
        for identity in &self.identities {
            out.push_str(&identity.to_inline());
            out.push('\n');
        }
        out.push_str("Joiners:\n");
        for joiner in &self.joiners {
            out.push_str(&joiner.to_inline());
            out.push('\n');
        }
        out.push_str("Actives:\n");
        for active in &self.actives {
            out.push_str(&active.to_inline());
            out.push('\n');
        }
        out.push_str("Leavers:\n");
        for leaver in &self.leavers {
            out.push_str(&leaver.to_inline());
            out.push('\n');
        }
        out.push_str("Excluded:\n");
        for excluded in &self.excluded {
            out.push_str(excluded);
            out.push('\n');
        }
        out.push_str("Certifications:\n");
        for certification in &self.certifications {
            out.push_str(&certification.to_inline());
            out.push('\n');
        }
        out.push_str("Transactions:\n");
        for transaction in &self.transactions {
            transaction.write_compact(&mut out);
        }
        out.push_str(&format!("Nonce: {}\n", self.nonce));
        out
    }

    /// The complete wire document, signature line included.
    pub fn raw(&self) -> String {
        let mut out = self.signed_payload();
        out.push_str(&self.signature);
        out.push('\n');
        out
    }

    /// SHA-1 of the raw document, uppercase hex. The proof of work is the
    /// number of leading zero nibbles of this digest.
    pub fn hash(&self) -> String {
        crypto::sha1_hex(self.raw().as_bytes())
    }

    pub fn stamp(&self) -> BlockStamp {
        BlockStamp {
            number: self.number,
            hash: self.hash(),
        }
    }

    /// Protocol parameters committed by a root block.
    pub fn protocol_parameters(&self) -> Option<Result<ProtocolParameters, ParseError>> {
        self.parameters
            .as_deref()
            .map(ProtocolParameters::from_line)
    }

    /// Count of leading zero nibbles in an uppercase hex digest.
    pub fn zero_nibbles(hash: &str) -> usize {
        hash.chars().take_while(|c| *c == '0').count()
    }

    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let lines: Vec<&str> = raw.lines().collect();
        let mut pos = 0usize;

        let version = read_field(&lines, &mut pos, "Version")?
            .parse()
            .map_err(|_| ParseError::BadValue("Version"))?;
        let type_line = read_field(&lines, &mut pos, "Type")?;
        if type_line != "Block" {
            return Err(ParseError::BadValue("Type"));
        }
        let currency = read_field(&lines, &mut pos, "Currency")?.to_string();
        let number: u64 = read_field(&lines, &mut pos, "Number")?
            .parse()
            .map_err(|_| ParseError::BadValue("Number"))?;
        let pow_min = read_field(&lines, &mut pos, "PoWMin")?
            .parse()
            .map_err(|_| ParseError::BadValue("PoWMin"))?;
        let time = read_field(&lines, &mut pos, "Time")?
            .parse()
            .map_err(|_| ParseError::BadValue("Time"))?;
        let median_time = read_field(&lines, &mut pos, "MedianTime")?
            .parse()
            .map_err(|_| ParseError::BadValue("MedianTime"))?;

        let mut dividend = None;
        let mut ud_time = None;
        if lines
            .get(pos)
            .map_or(false, |l| l.starts_with("UniversalDividend: "))
        {
            dividend = Some(
                read_field(&lines, &mut pos, "UniversalDividend")?
                    .parse()
                    .map_err(|_| ParseError::BadValue("UniversalDividend"))?,
            );
            ud_time = Some(
                read_field(&lines, &mut pos, "UDTime")?
                    .parse()
                    .map_err(|_| ParseError::BadValue("UDTime"))?,
            );
        }

        let issuer = read_field(&lines, &mut pos, "Issuer")?.to_string();

        let (previous_hash, previous_issuer, parameters) = if number == 0 {
            (
                None,
                None,
                Some(read_field(&lines, &mut pos, "Parameters")?.to_string()),
            )
        } else {
            (
                Some(read_field(&lines, &mut pos, "PreviousHash")?.to_string()),
                Some(read_field(&lines, &mut pos, "PreviousIssuer")?.to_string()),
                None,
            )
        };

        let members_count = read_field(&lines, &mut pos, "MembersCount")?
            .parse()
            .map_err(|_| ParseError::BadValue("MembersCount"))?;
        let monetary_mass = read_field(&lines, &mut pos, "MonetaryMass")?
            .parse()
            .map_err(|_| ParseError::BadValue("MonetaryMass"))?;

        let identities = read_section(&lines, &mut pos, "Identities:")?
            .into_iter()
            .map(BlockIdentity::from_inline)
            .collect::<Result<_, _>>()?;
        let joiners = read_section(&lines, &mut pos, "Joiners:")?
            .into_iter()
            .map(BlockMembership::from_inline)
            .collect::<Result<_, _>>()?;
        let actives = read_section(&lines, &mut pos, "Actives:")?
            .into_iter()
            .map(BlockMembership::from_inline)
            .collect::<Result<_, _>>()?;
        let leavers = read_section(&lines, &mut pos, "Leavers:")?
            .into_iter()
            .map(BlockMembership::from_inline)
            .collect::<Result<_, _>>()?;
        let excluded = read_section(&lines, &mut pos, "Excluded:")?
            .into_iter()
            .map(|l| l.to_string())
            .collect();
        let certifications = read_section(&lines, &mut pos, "Certifications:")?
            .into_iter()
            .map(BlockCertification::from_inline)
            .collect::<Result<_, _>>()?;

        let tx_header = lines
            .get(pos)
            .ok_or(ParseError::MissingSection("Transactions:"))?;
        if *tx_header != "Transactions:" {
            return Err(ParseError::MissingSection("Transactions:"));
        }
        pos += 1;
        let mut transactions = Vec::new();
        while lines
            .get(pos)
            .map_or(false, |l| !l.starts_with("Nonce: "))
        {
            let (tx, next) = Transaction::read_compact(&lines, pos)?;
            transactions.push(tx);
            pos = next;
        }

        let nonce_line = lines.get(pos).ok_or(ParseError::MissingField("Nonce"))?;
        let nonce = nonce_line
            .strip_prefix("Nonce: ")
            .ok_or(ParseError::MissingField("Nonce"))?
            .parse()
            .map_err(|_| ParseError::BadValue("Nonce"))?;
        pos += 1;

        let signature = lines
            .get(pos)
            .ok_or(ParseError::UnexpectedEnd)?
            .to_string();
        pos += 1;
        if pos != lines.len() {
            return Err(ParseError::TrailingContent);
        }

        Ok(Block {
            version,
            currency,
            number,
            pow_min,
            time,
            median_time,
            dividend,
            ud_time,
            issuer,
            previous_hash,
            previous_issuer,
            parameters,
            members_count,
            monetary_mass,
            identities,
            joiners,
            actives,
            leavers,
            excluded,
            certifications,
            transactions,
            nonce,
            signature,
        })
    }
}

fn read_field<'a>(
    lines: &[&'a str],
    pos: &mut usize,
    key: &'static str,
) -> Result<&'a str, ParseError> {
    let line = lines.get(*pos).ok_or(ParseError::MissingField(key))?;
    let value = line
        .strip_prefix(key)
        .and_then(|rest| rest.strip_prefix(": "))
        .ok_or(ParseError::MissingField(key))?;
    *pos += 1;
    Ok(value)
}

fn read_section<'a>(
    lines: &[&'a str],
    pos: &mut usize,
    name: &'static str,
) -> Result<Vec<&'a str>, ParseError> {
    let header = lines.get(*pos).ok_or(ParseError::MissingSection(name))?;
    if *header != name {
        return Err(ParseError::MissingSection(name));
    }
    *pos += 1;
    let mut items = Vec::new();
    while let Some(line) = lines.get(*pos) {
        if SECTIONS.contains(line) || line.starts_with("Nonce: ") {
            break;
        }
        items.push(*line);
        *pos += 1;
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockcfg::{BlockCertification, BlockIdentity, BlockMembership};

    fn sample_block() -> Block {
        let identity = BlockIdentity {
            pubkey: "HgTTJLAQ5sqfknMq7yLPZbehtuLSsKj9CxWN7k8QvYJd".into(),
            signature: "ab01".into(),
            time: 1_700_000_000,
            uid: "cgeek".into(),
        };
        Block {
            version: 1,
            currency: "test_currency".into(),
            number: 0,
            pow_min: 0,
            time: 1_700_000_100,
            median_time: 1_700_000_100,
            dividend: None,
            ud_time: None,
            issuer: identity.pubkey.clone(),
            previous_hash: None,
            previous_issuer: None,
            parameters: Some(ProtocolParameters::default().to_line()),
            members_count: 1,
            monetary_mass: 0,
            identities: vec![identity.clone()],
            joiners: vec![BlockMembership {
                issuer: identity.pubkey.clone(),
                signature: "cd02".into(),
                number: 0,
                certts: identity.time,
                uid: identity.uid,
            }],
            actives: vec![],
            leavers: vec![],
            excluded: vec![],
            certifications: vec![BlockCertification {
                from: identity.pubkey.clone(),
                to: "9fx25FmeBDCYAnT5fxNyr2Z1M4qbd2sJp6apYBTBYsVv".into(),
                block_number: 0,
                signature: "ef03".into(),
            }],
            transactions: vec![],
            nonce: 42,
            signature: "deadbeef".into(),
        }
    }

    #[test]
    fn raw_roundtrip_is_identity() {
        let block = sample_block();
        let raw = block.raw();
        let parsed = Block::parse(&raw).unwrap();
        assert_eq!(parsed, block);
        assert_eq!(parsed.raw(), raw);
    }

    #[test]
    fn roundtrip_with_dividend_and_previous() {
        let mut block = sample_block();
        block.number = 5;
        block.parameters = None;
        block.previous_hash = Some("000A23".into());
        block.previous_issuer = Some(block.issuer.clone());
        block.dividend = Some(100);
        block.ud_time = Some(1_700_086_400);
        let raw = block.raw();
        let parsed = Block::parse(&raw).unwrap();
        assert_eq!(parsed, block);
        assert_eq!(parsed.raw(), raw);
    }

    #[test]
    fn hash_covers_nonce() {
        let block = sample_block();
        let mut other = block.clone();
        other.nonce += 1;
        assert_ne!(block.hash(), other.hash());
    }

    #[test]
    fn zero_nibbles_counts_prefix() {
        assert_eq!(Block::zero_nibbles("00A3F"), 2);
        assert_eq!(Block::zero_nibbles("F00"), 0);
    }
}
