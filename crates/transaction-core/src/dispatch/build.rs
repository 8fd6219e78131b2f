//! Construction of the requests the engine sends on its own behalf.

use std::net::SocketAddr;

use rvoip_sip_message::{CSeq, Method, Request, Response, Via, DEFAULT_MAX_FORWARDS};

use super::Target;
use crate::error::{Error, Result};
use crate::transport::Protocol;

/// Contact host replaced by the local address of the outgoing socket
pub const PLACEHOLDER_HOST: &str = "0.0.0.0";

/// Max-Forwards for a forwarded copy of `request`. A locally originated
/// request keeps its own value; a proxied one is decremented, and one that
/// arrived with 0 is refused. A missing header becomes the default.
pub fn next_max_forwards(request: &Request, local: bool) -> Result<u32> {
    match request.max_forwards {
        None => Ok(DEFAULT_MAX_FORWARDS),
        Some(hops) if local => Ok(hops),
        Some(0) => Err(Error::TooManyHops),
        Some(hops) => Ok(hops - 1),
    }
}

/// The Via the engine prepends to everything it sends.
pub fn local_via(protocol: Protocol, local: SocketAddr, branch: &str) -> Via {
    Via::new(protocol.via_token(), local.ip().to_string(), Some(local.port()), branch)
}

/// The copy of `original` sent on one branch.
pub fn branch_request(original: &Request, target: &Target, via: Via, max_forwards: u32, local: SocketAddr) -> Request {
    let mut request = original.clone();
    request.uri = target.uri.clone();
    request.via.insert(0, via);
    request.max_forwards = Some(max_forwards);
    for contact in &mut request.contact {
        if contact.uri.host == PLACEHOLDER_HOST {
            contact.uri.host = local.ip().to_string();
            contact.uri.port = Some(local.port());
        }
    }
    request
}

/// CANCEL for a branch (RFC 3261 §9.1): same Request-URI, Call-ID, From, To,
/// CSeq number and Route set, and only the top Via of the request being
/// canceled.
pub fn cancel_request(branch: &Request) -> Request {
    Request {
        method: Method::Cancel,
        uri: branch.uri.clone(),
        via: branch.via.first().cloned().into_iter().collect(),
        from: branch.from.clone(),
        to: branch.to.clone(),
        call_id: branch.call_id.clone(),
        cseq: CSeq::new(branch.cseq.seq, Method::Cancel),
        max_forwards: Some(DEFAULT_MAX_FORWARDS),
        contact: Vec::new(),
        route: branch.route.clone(),
        record_route: Vec::new(),
        headers: Vec::new(),
        body: Default::default(),
    }
}

/// ACK for a non-2xx final response (RFC 3261 §17.1.1.3): To comes from
/// the response, everything else from the acknowledged request.
pub fn ack_request(branch: &Request, response: &Response) -> Request {
    Request {
        method: Method::Ack,
        uri: branch.uri.clone(),
        via: branch.via.first().cloned().into_iter().collect(),
        from: branch.from.clone(),
        to: response.to.clone(),
        call_id: branch.call_id.clone(),
        cseq: CSeq::new(branch.cseq.seq, Method::Ack),
        max_forwards: Some(DEFAULT_MAX_FORWARDS),
        contact: Vec::new(),
        route: branch.route.clone(),
        record_route: Vec::new(),
        headers: Vec::new(),
        body: Default::default(),
    }
}

/// A response relayed upstream loses the Via this hop added.
pub fn upstream_response(response: &Response) -> Response {
    let mut relayed = response.clone();
    if !relayed.via.is_empty() {
        relayed.via.remove(0);
    }
    relayed
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvoip_sip_message::{SimpleRequestBuilder, StatusCode};

    fn invite(max_forwards: Option<u32>) -> Request {
        SimpleRequestBuilder::new(Method::Invite, "sip:bob@example.com")
            .unwrap()
            .via("SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKup")
            .unwrap()
            .from("<sip:alice@example.com>;tag=a")
            .unwrap()
            .to("<sip:bob@example.com>")
            .unwrap()
            .contact("<sip:alice@0.0.0.0>")
            .unwrap()
            .route("<sip:edge.example.com;lr>")
            .unwrap()
            .call_id("build-1")
            .cseq(11)
            .max_forwards(max_forwards)
            .build()
            .unwrap()
    }

    fn local() -> SocketAddr {
        "203.0.113.5:5060".parse().unwrap()
    }

    #[test]
    fn max_forwards_rules() {
        assert_eq!(next_max_forwards(&invite(Some(70)), false).unwrap(), 69);
        assert_eq!(next_max_forwards(&invite(Some(1)), false).unwrap(), 0);
        assert!(matches!(next_max_forwards(&invite(Some(0)), false), Err(Error::TooManyHops)));
        assert_eq!(next_max_forwards(&invite(None), false).unwrap(), DEFAULT_MAX_FORWARDS);
        assert_eq!(next_max_forwards(&invite(Some(5)), true).unwrap(), 5);
    }

    #[test]
    fn branch_copy() {
        let original = invite(Some(70));
        let target = Target::parse("sip:bob@198.51.100.7").unwrap();
        let via = local_via(Protocol::Udp, local(), "z9hG4bK1.0.0");
        let out = branch_request(&original, &target, via, 69, local());
        assert_eq!(out.uri.host, "198.51.100.7");
        assert_eq!(out.via.len(), 2);
        assert_eq!(out.via[0].branch(), Some("z9hG4bK1.0.0"));
        assert_eq!(out.via[1], original.via[0]);
        assert_eq!(out.max_forwards, Some(69));
        assert_eq!(out.contact[0].uri.host, "203.0.113.5");
        assert_eq!(out.contact[0].uri.port, Some(5060));
    }

    #[test]
    fn cancel_and_ack_follow_the_branch() {
        let original = invite(Some(70));
        let target = Target::parse("sip:bob@198.51.100.7").unwrap();
        let out = branch_request(&original, &target, local_via(Protocol::Udp, local(), "z9hG4bK2.0.1"), 69, local());

        let cancel = cancel_request(&out);
        assert_eq!(cancel.method, Method::Cancel);
        assert_eq!(cancel.via, vec![out.via[0].clone()]);
        assert_eq!(cancel.cseq, CSeq::new(11, Method::Cancel));
        assert_eq!(cancel.uri, out.uri);
        assert_eq!(cancel.route, out.route);

        let busy = Response::from_request(&out, StatusCode::BUSY_HERE, None).with_to_tag("callee");
        let ack = ack_request(&out, &busy);
        assert_eq!(ack.cseq, CSeq::new(11, Method::Ack));
        assert_eq!(ack.to_tag(), Some("callee"));
        assert_eq!(ack.via.len(), 1);

        let upstream = upstream_response(&busy);
        assert_eq!(upstream.via, original.via);
    }
}
