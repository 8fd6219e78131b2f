use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use rvoip_sip_message::{Method, Request, Uri, Via, BRANCH_MAGIC_COOKIE};

use crate::config::{MatchingMode, TmConfig};
use crate::error::{Error, Result};

/// The request attributes transaction matching looks at.
///
/// Two matching procedures exist. RFC 3261 §17.2.3 matches on the top Via
/// branch, the Via sent-by and the method; it only applies when the branch
/// carries the `z9hG4bK` magic cookie. The RFC 2543 procedure compares
/// Call-ID, CSeq, the From/To tags and optionally the Request-URI and the
/// top Via. Which one is used is decided per request by
/// [`MatchingOptions::uses_branch`].
#[derive(Clone, PartialEq, Eq)]
pub struct TransactionKey {
    pub call_id: String,
    pub cseq: u32,
    pub method: Method,
    pub from_tag: Option<String>,
    pub to_tag: Option<String>,
    pub request_uri: Uri,
    pub top_via: Option<Via>,
}

impl TransactionKey {
    pub fn from_request(request: &Request) -> Self {
        Self {
            call_id: request.call_id.clone(),
            cseq: request.cseq.seq,
            method: request.method.clone(),
            from_tag: request.from_tag().map(str::to_string),
            to_tag: request.to_tag().map(str::to_string),
            request_uri: request.uri.clone(),
            top_via: request.top_via().cloned(),
        }
    }

    /// The top Via branch, if it carries the magic cookie.
    pub fn branch(&self) -> Option<&str> {
        self.top_via
            .as_ref()
            .filter(|via| via.has_rfc3261_branch())
            .and_then(Via::branch)
    }

    pub fn sent_by(&self) -> Option<String> {
        self.top_via.as_ref().map(Via::sent_by)
    }

    pub fn is_rfc3261(&self) -> bool {
        self.branch().is_some()
    }

    /// Index of the table bucket for a table of `buckets` (a power of two).
    pub fn bucket(&self, buckets: usize) -> usize {
        bucket_index(&self.call_id, self.cseq, buckets)
    }

    /// RFC 3261 §17.2.3: same branch, same sent-by, same method, where ACK
    /// matches the INVITE it acknowledges.
    pub fn matches_branch(&self, candidate: &TransactionKey) -> bool {
        match (self.branch(), candidate.branch()) {
            (Some(ours), Some(theirs)) => {
                ours == theirs
                    && self.sent_by() == candidate.sent_by()
                    && method_matches(&self.method, &candidate.method)
            }
            _ => false,
        }
    }

    /// RFC 2543 matching. `sent_to_tag` is the To tag of the final response
    /// the candidate sent upstream; an ACK is compared against it.
    pub fn matches_legacy(&self, candidate: &TransactionKey, options: &MatchingOptions, sent_to_tag: Option<&str>) -> bool {
        if self.call_id != candidate.call_id
            || self.cseq != candidate.cseq
            || !method_matches(&self.method, &candidate.method)
            || self.from_tag != candidate.from_tag
        {
            return false;
        }
        if self.method == Method::Ack {
            let expected = sent_to_tag.or(candidate.to_tag.as_deref());
            if self.to_tag.as_deref() != expected {
                return false;
            }
        } else {
            if self.to_tag != candidate.to_tag {
                return false;
            }
            if options.ruri && self.request_uri != candidate.request_uri {
                return false;
            }
        }
        !options.via1 || same_via(self.top_via.as_ref(), candidate.top_via.as_ref())
    }

    /// Whether this CANCEL refers to the `candidate` transaction.
    pub fn matches_cancel(&self, candidate: &TransactionKey, options: &MatchingOptions) -> bool {
        if matches!(candidate.method, Method::Cancel | Method::Ack) {
            return false;
        }
        if options.uses_branch(self) {
            return match (self.branch(), candidate.branch()) {
                (Some(ours), Some(theirs)) => ours == theirs && self.sent_by() == candidate.sent_by(),
                _ => false,
            };
        }
        self.call_id == candidate.call_id
            && self.cseq == candidate.cseq
            && self.from_tag == candidate.from_tag
            && self.to_tag == candidate.to_tag
            && (!options.ruri || self.request_uri == candidate.request_uri)
            && (!options.via1 || same_via(self.top_via.as_ref(), candidate.top_via.as_ref()))
    }

    /// Whether this ACK acknowledges a 2xx the INVITE `candidate` relayed
    /// with one of `ok_to_tags`.
    pub fn matches_e2e_ack(&self, candidate: &TransactionKey, ok_to_tags: &[String]) -> bool {
        candidate.method == Method::Invite
            && self.call_id == candidate.call_id
            && self.cseq == candidate.cseq
            && self.from_tag == candidate.from_tag
            && self
                .to_tag
                .as_ref()
                .is_some_and(|tag| ok_to_tags.iter().any(|t| t == tag))
    }
}

impl fmt::Debug for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.call_id, self.cseq, self.method)?;
        if let Some(branch) = self.branch() {
            write!(f, ":{}", branch)?;
        }
        Ok(())
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", self)
    }
}

fn method_matches(incoming: &Method, candidate: &Method) -> bool {
    incoming == candidate || (*incoming == Method::Ack && *candidate == Method::Invite)
}

fn same_via(a: Option<&Via>, b: Option<&Via>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.sent_by() == b.sent_by() && a.transport == b.transport && a.branch() == b.branch(),
        (None, None) => true,
        _ => false,
    }
}

/// Uniform hash over Call-ID and CSeq number.
pub fn bucket_index(call_id: &str, cseq: u32, buckets: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    call_id.hash(&mut hasher);
    cseq.hash(&mut hasher);
    (hasher.finish() as usize) & (buckets.max(1) - 1)
}

/// Matching configuration shared by the table lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchingOptions {
    pub mode: MatchingMode,
    pub ruri: bool,
    pub via1: bool,
}

impl MatchingOptions {
    pub fn from_config(config: &TmConfig) -> Self {
        Self {
            mode: config.matching_mode,
            ruri: config.legacy_ruri_matching,
            via1: config.legacy_via1_matching,
        }
    }

    /// Branch matching applies to cookie-carrying requests unless legacy
    /// matching is forced.
    pub fn uses_branch(&self, key: &TransactionKey) -> bool {
        self.mode == MatchingMode::BranchAware && key.is_rfc3261()
    }
}

impl Default for MatchingOptions {
    fn default() -> Self {
        Self::from_config(&TmConfig::default())
    }
}

/// Identity of an outgoing branch, encoded in the Via branch parameter of
/// every request the engine sends as `z9hG4bK<bucket hex>.<label hex>.<index>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchId {
    pub bucket: usize,
    pub label: u32,
    pub branch: usize,
}

impl BranchId {
    pub fn new(bucket: usize, label: u32, branch: usize) -> Self {
        Self { bucket, label, branch }
    }

    pub fn encode(&self) -> String {
        format!("{}{:x}.{:x}.{}", BRANCH_MAGIC_COOKIE, self.bucket, self.label, self.branch)
    }

    pub fn decode(value: &str) -> Option<Self> {
        let rest = value.strip_prefix(BRANCH_MAGIC_COOKIE)?;
        let mut parts = rest.split('.');
        let bucket = usize::from_str_radix(parts.next()?, 16).ok()?;
        let label = u32::from_str_radix(parts.next()?, 16).ok()?;
        let branch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { bucket, label, branch })
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for BranchId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BranchId::decode(s).ok_or_else(|| Error::protocol(format!("branch {} was not generated here", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvoip_sip_message::SimpleRequestBuilder;

    fn request(method: Method, via: &str, to: &str) -> Request {
        SimpleRequestBuilder::new(method, "sip:bob@example.com")
            .unwrap()
            .via(via)
            .unwrap()
            .from("<sip:alice@example.com>;tag=a1")
            .unwrap()
            .to(to)
            .unwrap()
            .call_id("key-test")
            .cseq(7)
            .build()
            .unwrap()
    }

    const VIA: &str = "SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKabc";

    #[test]
    fn branch_matching_pairs_ack_with_invite() {
        let invite = TransactionKey::from_request(&request(Method::Invite, VIA, "<sip:bob@example.com>"));
        let ack = TransactionKey::from_request(&request(Method::Ack, VIA, "<sip:bob@example.com>;tag=b1"));
        let cancel = TransactionKey::from_request(&request(Method::Cancel, VIA, "<sip:bob@example.com>"));
        assert!(ack.matches_branch(&invite));
        assert!(!cancel.matches_branch(&invite));
        assert!(cancel.matches_cancel(&invite, &MatchingOptions::default()));

        let other_host = TransactionKey::from_request(&request(
            Method::Invite,
            "SIP/2.0/UDP 192.0.2.2:5060;branch=z9hG4bKabc",
            "<sip:bob@example.com>",
        ));
        assert!(!other_host.matches_branch(&invite));
    }

    #[test]
    fn rfc2543_requests_use_legacy_matching() {
        let via = "SIP/2.0/UDP 192.0.2.1:5060;branch=old1";
        let invite = TransactionKey::from_request(&request(Method::Invite, via, "<sip:bob@example.com>"));
        let options = MatchingOptions::default();
        assert!(!options.uses_branch(&invite));

        let dup = TransactionKey::from_request(&request(Method::Invite, via, "<sip:bob@example.com>"));
        assert!(dup.matches_legacy(&invite, &options, None));

        // ACK carries the tag of the response we sent
        let ack = TransactionKey::from_request(&request(Method::Ack, via, "<sip:bob@example.com>;tag=ours"));
        assert!(ack.matches_legacy(&invite, &options, Some("ours")));
        assert!(!ack.matches_legacy(&invite, &options, Some("theirs")));

        let mut moved = dup.clone();
        moved.request_uri = Uri::sip("elsewhere.example.com");
        assert!(!moved.matches_legacy(&invite, &options, None));
        let lax = MatchingOptions { ruri: false, ..options };
        assert!(moved.matches_legacy(&invite, &lax, None));
    }

    #[test]
    fn legacy_mode_ignores_cookie() {
        let key = TransactionKey::from_request(&request(Method::Invite, VIA, "<sip:bob@example.com>"));
        let legacy = MatchingOptions {
            mode: MatchingMode::Legacy,
            ..Default::default()
        };
        assert!(!legacy.uses_branch(&key));
        assert!(MatchingOptions::default().uses_branch(&key));
    }

    #[test]
    fn e2e_ack_needs_a_relayed_tag() {
        let invite = TransactionKey::from_request(&request(Method::Invite, VIA, "<sip:bob@example.com>"));
        let ack = TransactionKey::from_request(&request(
            Method::Ack,
            "SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKnew",
            "<sip:bob@example.com>;tag=fork2",
        ));
        assert!(ack.matches_e2e_ack(&invite, &["fork1".to_string(), "fork2".to_string()]));
        assert!(!ack.matches_e2e_ack(&invite, &["fork1".to_string()]));
    }

    #[test]
    fn branch_id_encoding() {
        let id = BranchId::new(0xabc, 0x12, 3);
        assert_eq!(id.encode(), "z9hG4bKabc.12.3");
        assert_eq!(BranchId::decode("z9hG4bKabc.12.3"), Some(id));
        assert_eq!("z9hG4bKabc.12.3".parse::<BranchId>().unwrap(), id);
        assert!(BranchId::decode("z9hG4bKdeadbeef").is_none());
        assert!(BranchId::decode("abc.12.3").is_none());
        assert!("z9hG4bK1.2.3.4".parse::<BranchId>().is_err());
    }

    #[test]
    fn bucket_index_is_stable_and_bounded() {
        let a = bucket_index("call-1", 1, 16);
        assert_eq!(a, bucket_index("call-1", 1, 16));
        assert!(a < 16);
        assert_eq!(bucket_index("anything", 9, 1), 0);
    }
}
