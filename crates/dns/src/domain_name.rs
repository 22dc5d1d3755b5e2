use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use idna::AsciiDenyList;

/// A wrapper type for domain names.
///
/// `canonical` is stored lowercase so that identity (equality, hashing, and
/// `Deref<Target = str>`) is case-insensitive, matching DNS name semantics.
/// `original` retains whatever case the name had on the wire (or as
/// constructed), so DNS 0x20 case-randomization can be checked byte-for-byte
/// without re-parsing the message.
#[derive(Debug, Clone)]
pub struct DomainName {
    canonical: Arc<str>,
    original: Arc<str>,
}

impl DomainName {
    /// Create a new Qname from an ASCII string.
    /// The domain name is validated according to RFC 1035.
    ///
    /// NOTE: This function does not support Unicode domain names and should only be called with ASCII input.
    pub fn from_ascii(s: impl AsRef<str>) -> anyhow::Result<Self> {
        let mut str: String = s.as_ref().into();

        // Handle root
        if &str == "." || str.is_empty() {
            return Ok(Self::root());
        }

        // Remove trailing dot if present.
        if str.ends_with('.') {
            str.pop();
        }

        let bytes = str.as_bytes();

        // Validate the domain name according to RFC 1035.
        if bytes.len() > 255 {
            anyhow::bail!("domain name too long (bytes): {}", str);
        }

        for label in str.split('.') {
            // No empty labels allowed (except for root, which is handled above).
            if label.is_empty() {
                anyhow::bail!("empty domain label in: {}", str);
            }

            // Every label must be between 1 and 63 characters long (RFC 1035).
            if label.len() > 63 {
                anyhow::bail!("domain label too long: {}", label);
            }
        }

        let original: Arc<str> = Arc::from(str.trim());
        let mut lowered = str;
        lowered.make_ascii_lowercase();

        Ok(Self {
            canonical: Arc::from(lowered.trim()),
            original,
        })
    }

    /// Create a new Qname from a user input string.
    /// This function supports Unicode domain names and performs IDNA conversion.
    pub fn from_user(s: impl AsRef<str>) -> anyhow::Result<Self> {
        let input = s.as_ref().trim();

        if input == "." {
            return Ok(Self::root());
        }

        let name = if input.ends_with('.') {
            input.strip_suffix('.').unwrap()
        } else {
            input
        };

        // IDNA to ASCII
        let ascii = idna::domain_to_ascii_cow(name.as_bytes(), AsciiDenyList::URL)
            .map_err(|_| anyhow::anyhow!("invalid IDNA domain: {}", input))?;

        Self::from_ascii(&ascii)
    }

    pub fn root() -> Self {
        Self {
            canonical: Arc::from("."),
            original: Arc::from("."),
        }
    }

    /// Get the (lowercased) string representation of the DomainName.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Get the name exactly as it was cased when constructed/parsed.
    ///
    /// Used for DNS 0x20 case-sensitive question comparison; everywhere else
    /// identity should go through the case-insensitive `canonical` form.
    pub fn original_case(&self) -> &str {
        &self.original
    }
}

impl PartialEq for DomainName {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for DomainName {}

impl Hash for DomainName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl Deref for DomainName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.canonical
    }
}

impl Display for DomainName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical)
    }
}
