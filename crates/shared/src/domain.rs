use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

/// Identifier of a purchasable product, as minted by the offer tooling:
/// `domain_offerId_termCode_name_date`, underscore-delimited.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sku(pub String);

impl Sku {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sku {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical billing term of an offer. Unrecognised term codes pass through
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Trial,
    Monthly,
    Annual,
    Other(String),
}

impl Term {
    pub fn as_str(&self) -> &str {
        match self {
            Term::Trial => "trial",
            Term::Monthly => "monthly",
            Term::Annual => "annual",
            Term::Other(code) => code,
        }
    }
}

impl Serialize for Term {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Offer metadata decoded from a SKU. Field names match the analytics wire
/// format, so this flattens straight into tracking events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferData {
    pub offer_id: String,
    pub sku_id: String,
    pub product_name: String,
    pub term: Term,
    pub product_type: String,
    pub is_trial: bool,
    pub is_premium: bool,
}

/// Which backend scenario a user resolution runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserScenario {
    EntitledUser,
    NewUser,
}

/// Decode a SKU into offer metadata. Only SKUs minted for the given
/// publisher domain decode; anything else returns `None` and callers fall
/// back to the opaque id.
pub fn decode_sku(sku: &Sku, publisher_domain: &str) -> Option<OfferData> {
    let lowered = sku.as_str().to_ascii_lowercase();
    let mut parts = lowered.split('_');
    let domain = parts.next().unwrap_or_default();
    let offer_id = parts.next().unwrap_or_default();
    let term_code = parts.next().unwrap_or_default();
    let name = parts.next().unwrap_or_default();

    if domain.is_empty() || domain != publisher_domain.to_ascii_lowercase() {
        return None;
    }

    let is_trial = name.contains("trial");
    let term = if is_trial {
        Term::Trial
    } else if term_code.contains("1m") {
        Term::Monthly
    } else if term_code.contains("1y") {
        Term::Annual
    } else {
        Term::Other(term_code.to_string())
    };

    Some(OfferData {
        offer_id: offer_id.replace('.', "-"),
        sku_id: sku.as_str().to_string(),
        product_name: name.replace('.', " "),
        term,
        product_type: "Digital".to_string(),
        is_trial,
        is_premium: name.contains("premium"),
    })
}
