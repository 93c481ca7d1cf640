use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// A parsed state file. Unknown fields are kept verbatim in `raw`.
#[derive(Debug, Clone)]
pub struct StateDocument {
    raw: Value,
}

impl StateDocument {
    pub fn parse(body: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(body)
            .map_err(|e| Error::Validation(format!("state is not valid JSON: {}", e)))?;
        Self::from_value(raw)
    }

    pub fn from_value(raw: Value) -> Result<Self> {
        if !raw.is_object() {
            return Err(Error::Validation("state must be a JSON object".into()));
        }
        Ok(Self { raw })
    }

    /// Non-empty `lineage`, if present.
    pub fn lineage(&self) -> Option<&str> {
        self.raw
            .get("lineage")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn serial(&self) -> Option<i64> {
        let serial = self.raw.get("serial")?;
        serial
            .as_i64()
            .or_else(|| serial.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
    }

    pub fn require_lineage(&self) -> Result<&str> {
        self.lineage()
            .ok_or_else(|| Error::Validation("state missing required field: lineage".into()))
    }

    pub fn require_serial(&self) -> Result<i64> {
        self.serial()
            .ok_or_else(|| Error::Validation("state missing required field: serial".into()))
    }

    pub fn resources(&self) -> &[Value] {
        self.raw
            .get("resources")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Root `outputs` object, or an empty object.
    pub fn outputs(&self) -> Value {
        match self.raw.get("outputs") {
            Some(outputs @ Value::Object(_)) => outputs.clone(),
            _ => Value::Object(Default::default()),
        }
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

/// SHA-256 hex digest.
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_fields() {
        let doc = StateDocument::parse(r#"{"serial": 3, "resources": []}"#).unwrap();
        assert_eq!(
            doc.require_lineage().unwrap_err().to_string(),
            "state missing required field: lineage"
        );
        assert_eq!(doc.require_serial().unwrap(), 3);

        let doc = StateDocument::parse(r#"{"lineage": "", "serial": "x"}"#).unwrap();
        assert!(doc.lineage().is_none());
        assert!(doc.serial().is_none());
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(StateDocument::parse("[1,2]").is_err());
        assert!(StateDocument::parse("not json").is_err());
    }

    #[test]
    fn test_outputs_default_empty() {
        let doc = StateDocument::parse(r#"{"lineage":"L"}"#).unwrap();
        assert_eq!(doc.outputs(), serde_json::json!({}));
        assert!(doc.resources().is_empty());
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
