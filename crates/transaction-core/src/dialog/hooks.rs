//! Routing hooks: where an in-dialog request goes and which Route headers it
//! carries, derived from the route set and the remote target.
//!
//! Hooks are a cached function of (route set, remote target, remote URI,
//! destination URI override). [`compute_hooks`] always starts from scratch;
//! nothing patches a previous result.

use std::fmt::Write as _;

use rvoip_sip_message::Uri;
use serde::{Deserialize, Serialize};

const ROUTE_PREFIX: &str = "Route: ";
const ROUTE_SEPARATOR: &str = ",\r\n       ";

/// Addressing of the next in-dialog request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHooks {
    /// Request-URI
    pub request_uri: Uri,
    /// Where the request is physically sent
    pub next_hop: Uri,
    /// Index of the first route-set entry to emit as a Route header
    pub first_route: Option<usize>,
    /// Extra trailing Route entry (the remote target under strict routing)
    pub last_route: Option<Uri>,
}

impl RouteHooks {
    /// The Route entries to emit, in order.
    pub fn routes<'a>(&'a self, route_set: &'a [Uri]) -> impl Iterator<Item = &'a Uri> + 'a {
        let from = self.first_route.unwrap_or(route_set.len());
        route_set
            .get(from..)
            .unwrap_or_default()
            .iter()
            .chain(self.last_route.iter())
    }

    /// The printed Route header (with its CRLF), or `None` when there is
    /// nothing to emit.
    pub fn route_header(&self, route_set: &[Uri]) -> Option<String> {
        let mut routes = self.routes(route_set).peekable();
        routes.peek()?;
        let mut header = String::from(ROUTE_PREFIX);
        let mut first = true;
        for uri in routes {
            if !first {
                header.push_str(ROUTE_SEPARATOR);
            }
            first = false;
            let _ = write!(header, "<{}>", uri);
        }
        header.push_str("\r\n");
        Some(header)
    }

    pub fn route_header_length(&self, route_set: &[Uri]) -> usize {
        self.route_header(route_set).map_or(0, |h| h.len())
    }
}

/// Compute the hooks of a dialog.
///
/// With a route set, a first entry carrying `lr` means loose routing: the
/// Request-URI is the remote target and the request goes to the first route.
/// Without `lr` (strict routing) the first route becomes the Request-URI,
/// the remaining entries are emitted and the remote target is appended as
/// the last one. Without a route set both Request-URI and next hop are the
/// remote target, the destination override taking precedence for the next
/// hop. A missing remote target falls back to the remote URI, also as the
/// trailing strict-routing entry.
pub fn compute_hooks(
    route_set: &[Uri],
    remote_target: Option<&Uri>,
    remote_uri: &Uri,
    destination_uri: Option<&Uri>,
) -> RouteHooks {
    let target = remote_target.unwrap_or(remote_uri);
    match route_set.first() {
        Some(first) if first.is_loose_route() => RouteHooks {
            request_uri: target.clone(),
            next_hop: first.clone(),
            first_route: Some(0),
            last_route: None,
        },
        Some(first) => RouteHooks {
            request_uri: first.clone(),
            next_hop: first.clone(),
            first_route: (route_set.len() > 1).then_some(1),
            last_route: Some(target.clone()),
        },
        None => RouteHooks {
            request_uri: target.clone(),
            next_hop: destination_uri.unwrap_or(target).clone(),
            first_route: None,
            last_route: None,
        },
    }
}
