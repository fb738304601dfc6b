use super::ParseError;
use crate::crypto;

/// The coin source an input consumes: a universal dividend issued to a
/// member, or the output of a previous transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceKey {
    /// `D:PUBKEY:BLOCK`
    Dividend { pubkey: String, block: u64 },
    /// `T:TXHASH:INDEX`
    TxOutput { tx_hash: String, index: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub source: SourceKey,
    pub amount: u64,
}

impl TxInput {
    fn to_inline(&self) -> String {
        match &self.source {
            SourceKey::Dividend { pubkey, block } => {
                format!("D:{}:{}:{}", pubkey, block, self.amount)
            }
            SourceKey::TxOutput { tx_hash, index } => {
                format!("T:{}:{}:{}", tx_hash, index, self.amount)
            }
        }
    }

    fn from_inline(line: &str) -> Result<Self, ParseError> {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 4 {
            return Err(ParseError::BadInlineRecord("input"));
        }
        let amount = fields[3]
            .parse()
            .map_err(|_| ParseError::BadInlineRecord("input"))?;
        let source = match fields[0] {
            "D" => SourceKey::Dividend {
                pubkey: fields[1].to_string(),
                block: fields[2]
                    .parse()
                    .map_err(|_| ParseError::BadInlineRecord("input"))?,
            },
            "T" => SourceKey::TxOutput {
                tx_hash: fields[1].to_string(),
                index: fields[2]
                    .parse()
                    .map_err(|_| ParseError::BadInlineRecord("input"))?,
            },
            _ => return Err(ParseError::BadInlineRecord("input")),
        };
        Ok(TxInput { source, amount })
    }
}

/// `PUBKEY:AMOUNT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub pubkey: String,
    pub amount: u64,
}

/// A compact transaction as carried inside a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub issuers: Vec<String>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub comment: Option<String>,
    /// One signature per issuer, in issuer order.
    pub signatures: Vec<String>,
}

impl Transaction {
    pub fn input_sum(&self) -> u64 {
        self.inputs.iter().map(|i| i.amount).sum()
    }

    pub fn output_sum(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    /// The part covered by the issuers' signatures.
    pub fn signed_payload(&self) -> String {
        let mut out = self.header_line();
        out.push('\n');
        for issuer in &self.issuers {
            out.push_str(issuer);
            out.push('\n');
        }
        for input in &self.inputs {
            out.push_str(&input.to_inline());
            out.push('\n');
        }
        for output in &self.outputs {
            out.push_str(&format!("{}:{}\n", output.pubkey, output.amount));
        }
        if let Some(comment) = &self.comment {
            out.push_str(&format!("Comment: {}\n", comment));
        }
        out
    }

    pub fn hash(&self) -> String {
        let mut raw = self.signed_payload();
        for signature in &self.signatures {
            raw.push_str(signature);
            raw.push('\n');
        }
        crypto::sha256_hex(raw.as_bytes())
    }

    fn header_line(&self) -> String {
        format!(
            "TX:1:{}:{}:{}:{}",
            self.issuers.len(),
            self.inputs.len(),
            self.outputs.len(),
            if self.comment.is_some() { 1 } else { 0 }
        )
    }

    /// Append the compact form to a block document.
    pub(super) fn write_compact(&self, out: &mut String) {
        out.push_str(&self.signed_payload());
        for signature in &self.signatures {
            out.push_str(signature);
            out.push('\n');
        }
    }

    /// Read one compact transaction starting at `lines[pos]`. Returns the
    /// transaction and the position past its last line.
    pub(super) fn read_compact(
        lines: &[&str],
        pos: usize,
    ) -> Result<(Self, usize), ParseError> {
        let header = lines.get(pos).ok_or(ParseError::UnexpectedEnd)?;
        let fields: Vec<&str> = header.split(':').collect();
        if fields.len() != 6 || fields[0] != "TX" || fields[1] != "1" {
            return Err(ParseError::BadInlineRecord("transaction"));
        }
        let counts = |i: usize| -> Result<usize, ParseError> {
            fields[i]
                .parse()
                .map_err(|_| ParseError::BadInlineRecord("transaction"))
        };
        let nb_issuers = counts(2)?;
        let nb_inputs = counts(3)?;
        let nb_outputs = counts(4)?;
        let has_comment = fields[5] == "1";

        let mut cursor = pos + 1;
        let mut next_line = |what: &'static str| -> Result<&str, ParseError> {
            let line = lines.get(cursor).ok_or(ParseError::UnexpectedEnd)?;
            let _ = what;
            cursor += 1;
            Ok(line)
        };

        let mut issuers = Vec::with_capacity(nb_issuers);
        for _ in 0..nb_issuers {
            issuers.push(next_line("issuer")?.to_string());
        }
        let mut inputs = Vec::with_capacity(nb_inputs);
        for _ in 0..nb_inputs {
            inputs.push(TxInput::from_inline(next_line("input")?)?);
        }
        let mut outputs = Vec::with_capacity(nb_outputs);
        for _ in 0..nb_outputs {
            let line = next_line("output")?;
            let (pubkey, amount) = line
                .rsplit_once(':')
                .ok_or(ParseError::BadInlineRecord("output"))?;
            outputs.push(TxOutput {
                pubkey: pubkey.to_string(),
                amount: amount
                    .parse()
                    .map_err(|_| ParseError::BadInlineRecord("output"))?,
            });
        }
        let comment = if has_comment {
            let line = next_line("comment")?;
            Some(
                line.strip_prefix("Comment: ")
                    .ok_or(ParseError::BadInlineRecord("comment"))?
                    .to_string(),
            )
        } else {
            None
        };
        let mut signatures = Vec::with_capacity(nb_issuers);
        for _ in 0..nb_issuers {
            signatures.push(next_line("signature")?.to_string());
        }

        Ok((
            Transaction {
                issuers,
                inputs,
                outputs,
                comment,
                signatures,
            },
            cursor,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            issuers: vec!["HgTTJLAQ5sqfknMq7yLPZbehtuLSsKj9CxWN7k8QvYJd".into()],
            inputs: vec![
                TxInput {
                    source: SourceKey::Dividend {
                        pubkey: "HgTTJLAQ5sqfknMq7yLPZbehtuLSsKj9CxWN7k8QvYJd".into(),
                        block: 8,
                    },
                    amount: 100,
                },
                TxInput {
                    source: SourceKey::TxOutput {
                        tx_hash: "AA11".into(),
                        index: 0,
                    },
                    amount: 40,
                },
            ],
            outputs: vec![
                TxOutput {
                    pubkey: "9fx25FmeBDCYAnT5fxNyr2Z1M4qbd2sJp6apYBTBYsVv".into(),
                    amount: 120,
                },
                TxOutput {
                    pubkey: "HgTTJLAQ5sqfknMq7yLPZbehtuLSsKj9CxWN7k8QvYJd".into(),
                    amount: 20,
                },
            ],
            comment: Some("grocery".into()),
            signatures: vec!["beef".into()],
        }
    }

    #[test]
    fn compact_roundtrip() {
        let tx = sample_tx();
        let mut raw = String::new();
        tx.write_compact(&mut raw);
        let lines: Vec<&str> = raw.lines().collect();
        let (parsed, consumed) = Transaction::read_compact(&lines, 0).unwrap();
        assert_eq!(parsed, tx);
        assert_eq!(consumed, lines.len());
    }

    #[test]
    fn sums_and_hash() {
        let tx = sample_tx();
        assert_eq!(tx.input_sum(), 140);
        assert_eq!(tx.output_sum(), 140);
        assert_eq!(tx.hash().len(), 64);
    }
}
