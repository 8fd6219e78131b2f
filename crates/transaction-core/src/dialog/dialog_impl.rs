//! Dialog implementation for RFC 3261 SIP dialogs
//!
//! This module contains the [`Dialog`] struct: identity (Call-ID, tags),
//! sequence numbers, the route set and the routing hooks derived from it,
//! and the transitions driven by responses (UAC side) and requests (UAS
//! side).

use std::fmt;

use bytes::Bytes;
use rand::Rng;
use rvoip_sip_message::{CSeq, Method, NameAddr, Request, Response, StatusCode, Uri, DEFAULT_MAX_FORWARDS};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::errors::{DialogError, DialogResult};
use super::hooks::{compute_hooks, RouteHooks};

/// Dialog lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogState {
    /// Created, no response with a To tag seen yet
    New,
    /// A provisional response with a To tag arrived
    Early,
    /// A 2xx arrived (UAC) or the dialog was built from a request (UAS)
    Confirmed,
    /// Ended by a negative final response or a 481
    Destroyed,
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DialogState::New => "new",
            DialogState::Early => "early",
            DialogState::Confirmed => "confirmed",
            DialogState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// A CSeq value with an explicit "is set" marker, since 0 is a valid CSeq.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Sequence {
    pub value: u32,
    pub is_set: bool,
}

impl Sequence {
    pub fn set(value: u32) -> Self {
        Self { value, is_set: true }
    }

    pub fn unset(value: u32) -> Self {
        Self { value, is_set: false }
    }
}

/// Dialog identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};local-tag={};remote-tag={}",
            self.call_id,
            self.local_tag,
            self.remote_tag.as_deref().unwrap_or("")
        )
    }
}

/// What a response did to the dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogTransition {
    Unchanged,
    Early,
    Confirmed,
    TargetRefreshed,
    Destroyed,
}

/// A SIP dialog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dialog {
    call_id: String,
    local_tag: String,
    remote_tag: Option<String>,
    local_seq: Sequence,
    remote_seq: Sequence,
    local_uri: Uri,
    remote_uri: Uri,
    local_display_name: Option<String>,
    remote_display_name: Option<String>,
    /// Contact of the peer
    remote_target: Option<Uri>,
    /// Next-hop override, used only without a route set
    destination_uri: Option<Uri>,
    route_set: Vec<Uri>,
    hooks: RouteHooks,
    state: DialogState,
}

fn generate_tag() -> String {
    format!("{:08x}", rand::random::<u32>())
}

fn generate_call_id(host: &str) -> String {
    format!("{}@{}", uuid::Uuid::new_v4(), host)
}

fn initial_seq() -> u32 {
    rand::thread_rng().gen_range(1..(1u32 << 31))
}

impl Dialog {
    /// Create a UAC dialog. Missing Call-ID, local tag and initial CSeq are
    /// generated.
    pub fn new(
        call_id: Option<String>,
        local_tag: Option<String>,
        local_seq: Option<u32>,
        local_uri: Uri,
        remote_uri: Uri,
    ) -> Self {
        let call_id = call_id.unwrap_or_else(|| generate_call_id(&local_uri.host));
        let hooks = compute_hooks(&[], None, &remote_uri, None);
        let dialog = Self {
            call_id,
            local_tag: local_tag.unwrap_or_else(generate_tag),
            remote_tag: None,
            local_seq: Sequence::set(local_seq.unwrap_or_else(initial_seq)),
            remote_seq: Sequence::default(),
            local_uri,
            remote_uri,
            local_display_name: None,
            remote_display_name: None,
            remote_target: None,
            destination_uri: None,
            route_set: Vec::new(),
            hooks,
            state: DialogState::New,
        };
        debug!(call_id = %dialog.call_id, local_tag = %dialog.local_tag, "UAC dialog created");
        dialog
    }

    /// Create a UAS dialog from a dialog-creating request.
    pub fn from_request(request: &Request, local_tag: Option<String>) -> DialogResult<Self> {
        if request.call_id.is_empty() {
            return Err(DialogError::protocol("request without Call-ID"));
        }
        let contact = request
            .contact
            .first()
            .ok_or_else(|| DialogError::protocol(format!("{} without Contact", request.method)))?;
        if request.cseq.method != request.method {
            return Err(DialogError::protocol(format!(
                "CSeq method {} does not match {}",
                request.cseq.method, request.method
            )));
        }

        let mut dialog = Self {
            call_id: request.call_id.clone(),
            local_tag: local_tag
                .or_else(|| request.to_tag().map(str::to_string))
                .unwrap_or_else(generate_tag),
            remote_tag: request.from_tag().map(str::to_string),
            local_seq: Sequence::unset(initial_seq()),
            remote_seq: Sequence::set(request.cseq.seq),
            local_uri: request.to.uri.clone(),
            remote_uri: request.from.uri.clone(),
            local_display_name: request.to.display_name.clone(),
            remote_display_name: request.from.display_name.clone(),
            remote_target: Some(contact.uri.clone()),
            destination_uri: None,
            route_set: request.record_route.iter().map(|rr| rr.uri.clone()).collect(),
            hooks: compute_hooks(&[], None, &request.from.uri, None),
            state: DialogState::Confirmed,
        };
        dialog.recompute_hooks();
        debug!(id = %dialog.id(), routes = dialog.route_set.len(), "UAS dialog created");
        Ok(dialog)
    }

    pub fn id(&self) -> DialogId {
        DialogId {
            call_id: self.call_id.clone(),
            local_tag: self.local_tag.clone(),
            remote_tag: self.remote_tag.clone(),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    pub fn remote_tag(&self) -> Option<&str> {
        self.remote_tag.as_deref()
    }

    pub fn local_seq(&self) -> Sequence {
        self.local_seq
    }

    pub fn remote_seq(&self) -> Sequence {
        self.remote_seq
    }

    pub fn local_uri(&self) -> &Uri {
        &self.local_uri
    }

    pub fn remote_uri(&self) -> &Uri {
        &self.remote_uri
    }

    pub fn remote_target(&self) -> Option<&Uri> {
        self.remote_target.as_ref()
    }

    pub fn destination_uri(&self) -> Option<&Uri> {
        self.destination_uri.as_ref()
    }

    pub fn route_set(&self) -> &[Uri] {
        &self.route_set
    }

    pub fn hooks(&self) -> &RouteHooks {
        &self.hooks
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    pub fn set_route_set(&mut self, routes: Vec<Uri>) {
        self.route_set = routes;
        self.recompute_hooks();
    }

    pub fn set_remote_target(&mut self, target: Uri) {
        self.remote_target = Some(target);
        self.recompute_hooks();
    }

    pub fn set_destination_uri(&mut self, destination: Option<Uri>) {
        self.destination_uri = destination;
        self.recompute_hooks();
    }

    /// Display names used in From / To of requests built from this dialog.
    pub fn add_display_names(&mut self, local: Option<String>, remote: Option<String>) {
        if local.is_some() {
            self.local_display_name = local;
        }
        if remote.is_some() {
            self.remote_display_name = remote;
        }
    }

    fn recompute_hooks(&mut self) {
        self.hooks = compute_hooks(
            &self.route_set,
            self.remote_target.as_ref(),
            &self.remote_uri,
            self.destination_uri.as_ref(),
        );
    }

    /// The Route header of the next request, if any.
    pub fn route_header(&self) -> Option<String> {
        self.hooks.route_header(&self.route_set)
    }

    pub fn route_header_length(&self) -> usize {
        self.hooks.route_header_length(&self.route_set)
    }

    /// Increment the local CSeq and return it.
    pub fn next_local_seq(&mut self) -> u32 {
        self.local_seq.value = self.local_seq.value.wrapping_add(1);
        self.local_seq.is_set = true;
        self.local_seq.value
    }

    fn check_call_id(&self, call_id: &str) -> DialogResult<()> {
        if call_id == self.call_id {
            Ok(())
        } else {
            Err(DialogError::Mismatch {
                expected: self.call_id.clone(),
                found: call_id.to_string(),
            })
        }
    }

    fn capture_routing(&mut self, response: &Response) {
        if let Some(contact) = response.contact.first() {
            self.remote_target = Some(contact.uri.clone());
        }
        self.route_set = response.record_route.iter().rev().map(|rr| rr.uri.clone()).collect();
        self.recompute_hooks();
    }

    /// UAC side: update the dialog with a response to one of its requests.
    ///
    /// A negative final response ending a dialog is a normal outcome,
    /// reported as [`DialogTransition::Destroyed`] and not as an error.
    pub fn apply_response(&mut self, response: &Response) -> DialogResult<DialogTransition> {
        self.check_call_id(&response.call_id)?;
        let code = response.status;

        let transition = match self.state {
            DialogState::New | DialogState::Early => {
                if code == StatusCode::TRYING {
                    DialogTransition::Unchanged
                } else if code.is_provisional() {
                    match response.to_tag() {
                        Some(tag) => {
                            self.remote_tag = Some(tag.to_string());
                            self.capture_routing(response);
                            self.state = DialogState::Early;
                            DialogTransition::Early
                        }
                        None => DialogTransition::Unchanged,
                    }
                } else if code.is_success() {
                    let tag = response
                        .to_tag()
                        .ok_or_else(|| DialogError::protocol("2xx without To tag"))?;
                    self.remote_tag = Some(tag.to_string());
                    self.capture_routing(response);
                    self.state = DialogState::Confirmed;
                    DialogTransition::Confirmed
                } else {
                    self.state = DialogState::Destroyed;
                    DialogTransition::Destroyed
                }
            }
            DialogState::Confirmed => {
                if code == StatusCode::CALL_DOES_NOT_EXIST {
                    self.state = DialogState::Destroyed;
                    DialogTransition::Destroyed
                } else if code.is_success() && response.cseq.method.is_target_refresh() {
                    match response.contact.first() {
                        Some(contact) if self.remote_target.as_ref() != Some(&contact.uri) => {
                            self.set_remote_target(contact.uri.clone());
                            DialogTransition::TargetRefreshed
                        }
                        _ => DialogTransition::Unchanged,
                    }
                } else {
                    DialogTransition::Unchanged
                }
            }
            DialogState::Destroyed => DialogTransition::Unchanged,
        };

        if transition != DialogTransition::Unchanged {
            debug!(id = %self.id(), status = code.as_u16(), ?transition, "dialog updated");
        }
        Ok(transition)
    }

    /// UAS side: account for an in-dialog request. Returns `Ok(false)` for a
    /// request whose CSeq is not above the last one seen.
    pub fn apply_request(&mut self, request: &Request) -> DialogResult<bool> {
        self.check_call_id(&request.call_id)?;
        if matches!(request.method, Method::Ack | Method::Cancel) {
            return Ok(true);
        }
        if self.remote_seq.is_set && request.cseq.seq <= self.remote_seq.value {
            debug!(id = %self.id(), cseq = request.cseq.seq, last = self.remote_seq.value, "out of order request");
            return Ok(false);
        }
        self.remote_seq = Sequence::set(request.cseq.seq);

        if request.method.is_target_refresh() {
            if let Some(contact) = request.contact.first() {
                self.set_remote_target(contact.uri.clone());
            }
        }
        Ok(true)
    }

    /// Build an in-dialog request addressed by the current hooks. The Via
    /// is left for the sender to add. ACK and CANCEL reuse the current
    /// local CSeq; every other method takes the next one.
    pub fn build_request(&mut self, method: Method) -> DialogResult<Request> {
        if self.state == DialogState::Destroyed {
            return Err(DialogError::InvalidState {
                operation: format!("build {}", method),
                state: self.state,
            });
        }
        let seq = match method {
            Method::Ack | Method::Cancel => self.local_seq.value,
            _ => self.next_local_seq(),
        };

        let mut from = NameAddr::new(self.local_uri.clone()).with_tag(self.local_tag.clone());
        from.display_name = self.local_display_name.clone();
        let mut to = NameAddr::new(self.remote_uri.clone());
        to.display_name = self.remote_display_name.clone();
        if let Some(tag) = &self.remote_tag {
            to.set_tag(tag.clone());
        }

        Ok(Request {
            uri: self.hooks.request_uri.clone(),
            via: Vec::new(),
            from,
            to,
            call_id: self.call_id.clone(),
            cseq: CSeq::new(seq, method.clone()),
            max_forwards: Some(DEFAULT_MAX_FORWARDS),
            contact: Vec::new(),
            route: self.hooks.routes(&self.route_set).cloned().map(NameAddr::new).collect(),
            record_route: Vec::new(),
            headers: Vec::new(),
            body: Bytes::new(),
            method,
        })
    }
}

impl fmt::Display for Dialog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seq = |s: &Sequence| {
            if s.is_set {
                s.value.to_string()
            } else {
                format!("{} (unset)", s.value)
            }
        };
        let opt = |u: Option<&Uri>| u.map_or_else(|| "-".to_string(), |u| u.to_string());

        writeln!(f, "==== dialog {} ====", self.call_id)?;
        writeln!(f, "state:          {}", self.state)?;
        writeln!(f, "local tag:      {}", self.local_tag)?;
        writeln!(f, "remote tag:     {}", self.remote_tag.as_deref().unwrap_or("-"))?;
        writeln!(f, "local seq:      {}", seq(&self.local_seq))?;
        writeln!(f, "remote seq:     {}", seq(&self.remote_seq))?;
        writeln!(f, "local uri:      {}", self.local_uri)?;
        writeln!(f, "remote uri:     {}", self.remote_uri)?;
        writeln!(f, "remote target:  {}", opt(self.remote_target.as_ref()))?;
        writeln!(f, "dst uri:        {}", opt(self.destination_uri.as_ref()))?;
        writeln!(f, "route set:")?;
        for route in &self.route_set {
            writeln!(f, "    {}", route)?;
        }
        writeln!(f, "hooks:")?;
        writeln!(f, "    request uri: {}", self.hooks.request_uri)?;
        writeln!(f, "    next hop:    {}", self.hooks.next_hop)?;
        writeln!(
            f,
            "    first route: {}",
            self.hooks
                .first_route
                .and_then(|i| self.route_set.get(i))
                .map_or_else(|| "-".to_string(), |u| u.to_string())
        )?;
        writeln!(f, "    last route:  {}", opt(self.hooks.last_route.as_ref()))?;
        write!(f, "==== end dialog ====")
    }
}
