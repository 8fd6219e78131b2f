//! Relay decisions for replies received on outgoing branches.
//!
//! These functions are pure: the manager records the reply on its branch,
//! describes the transaction with a [`RelayContext`] and the branch list with
//! [`BranchStatus`] values, and acts on the returned [`RelayDecision`].

use rvoip_sip_message::StatusCode;

/// What the decision needs to know about one branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BranchStatus {
    pub last_code: Option<StatusCode>,
    pub final_code: Option<StatusCode>,
}

impl BranchStatus {
    pub fn is_open(&self) -> bool {
        self.final_code.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayContext {
    pub is_invite: bool,
    /// A final response already went upstream
    pub uas_final: bool,
    /// A 6xx was received earlier on some branch
    pub six_xx: bool,
    pub canceled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDecision {
    /// Drop the reply
    Discard,
    /// Keep the reply on its branch and wait for the others
    Store { cancel_others: bool, six_xx: bool },
    /// Relay this provisional upstream
    Provisional,
    /// Relay this 2xx and cancel the other branches. After the transaction
    /// completed this is the "pushed" 2xx of a forked INVITE.
    Success,
    /// No branch is open any more and none succeeded.
    AllFailed { picked: usize, six_xx: bool },
}

/// Decide what to do with `code`, just recorded on `branch`.
pub fn decide(ctx: RelayContext, branches: &[BranchStatus], branch: usize, code: StatusCode) -> RelayDecision {
    if ctx.uas_final {
        return if ctx.is_invite && code.is_success() {
            RelayDecision::Success
        } else {
            RelayDecision::Discard
        };
    }

    if code.is_provisional() {
        return if code == StatusCode::TRYING || ctx.six_xx {
            RelayDecision::Discard
        } else {
            RelayDecision::Provisional
        };
    }

    if code.is_success() && !ctx.six_xx {
        return RelayDecision::Success;
    }

    let new_six_xx = code.class() == 6 && !ctx.six_xx;
    let still_open = branches
        .iter()
        .enumerate()
        .any(|(i, b)| i != branch && b.is_open());
    if still_open {
        return RelayDecision::Store {
            cancel_others: new_six_xx,
            six_xx: new_six_xx,
        };
    }

    match pick_branch(branches, ctx.canceled, ctx.six_xx || new_six_xx) {
        Some(picked) => RelayDecision::AllFailed {
            picked,
            six_xx: ctx.six_xx || new_six_xx,
        },
        None => RelayDecision::Discard,
    }
}

/// Ordering key of a final code for picking; lower wins. 503 sorts below
/// every class.
fn rank(code: StatusCode) -> (u16, u16) {
    if code == StatusCode::SERVICE_UNAVAILABLE {
        (u16::MAX, code.as_u16())
    } else {
        (code.class(), code.as_u16())
    }
}

/// The branch whose final reply goes upstream once every branch failed.
///
/// A 6xx wins once one was seen; a canceled transaction prefers a 487;
/// otherwise the lowest class wins, then the lowest code, then the lowest
/// branch index.
pub fn pick_branch(branches: &[BranchStatus], canceled: bool, six_xx: bool) -> Option<usize> {
    let finals = || {
        branches
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.final_code.map(|code| (i, code)))
    };
    if six_xx {
        if let Some((i, _)) = finals().find(|(_, code)| code.class() == 6) {
            return Some(i);
        }
    }
    if canceled {
        if let Some((i, _)) = finals().find(|(_, code)| *code == StatusCode::REQUEST_TERMINATED) {
            return Some(i);
        }
    }
    finals().min_by_key(|(_, code)| rank(*code)).map(|(i, _)| i)
}

/// The code a picked reply is relayed with: a 503 becomes a 500 (RFC 3261
/// §16.7 item 6).
pub fn relayed_code(code: StatusCode) -> StatusCode {
    if code == StatusCode::SERVICE_UNAVAILABLE {
        StatusCode::SERVER_INTERNAL_ERROR
    } else {
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(c: u16) -> StatusCode {
        StatusCode::from_u16(c).unwrap()
    }

    fn done(c: u16) -> BranchStatus {
        BranchStatus {
            last_code: Some(code(c)),
            final_code: Some(code(c)),
        }
    }

    fn open(last: Option<u16>) -> BranchStatus {
        BranchStatus {
            last_code: last.map(code),
            final_code: None,
        }
    }

    fn invite() -> RelayContext {
        RelayContext {
            is_invite: true,
            ..Default::default()
        }
    }

    #[test]
    fn provisionals() {
        let branches = [open(Some(100))];
        assert_eq!(decide(invite(), &branches, 0, code(100)), RelayDecision::Discard);
        assert_eq!(decide(invite(), &branches, 0, code(180)), RelayDecision::Provisional);
        let after_six = RelayContext { six_xx: true, ..invite() };
        assert_eq!(decide(after_six, &branches, 0, code(183)), RelayDecision::Discard);
    }

    #[test]
    fn success_relays_at_once() {
        let branches = [done(200), open(Some(180))];
        assert_eq!(decide(invite(), &branches, 0, code(200)), RelayDecision::Success);
    }

    #[test]
    fn failures_wait_for_open_branches() {
        let branches = [done(486), open(None)];
        assert_eq!(
            decide(invite(), &branches, 0, code(486)),
            RelayDecision::Store {
                cancel_others: false,
                six_xx: false
            }
        );
        let branches = [done(486), done(404)];
        assert_eq!(
            decide(invite(), &branches, 1, code(404)),
            RelayDecision::AllFailed { picked: 1, six_xx: false }
        );
    }

    #[test]
    fn six_xx_cancels_and_wins() {
        let branches = [done(603), open(Some(180))];
        assert_eq!(
            decide(invite(), &branches, 0, code(603)),
            RelayDecision::Store {
                cancel_others: true,
                six_xx: true
            }
        );
        // the late 2xx does not override it
        let ctx = RelayContext { six_xx: true, ..invite() };
        let branches = [done(603), done(200)];
        assert_eq!(
            decide(ctx, &branches, 1, code(200)),
            RelayDecision::AllFailed { picked: 0, six_xx: true }
        );
    }

    #[test]
    fn pushed_2xx_after_completion() {
        let ctx = RelayContext { uas_final: true, ..invite() };
        assert_eq!(decide(ctx, &[done(200)], 0, code(200)), RelayDecision::Success);
        assert_eq!(decide(ctx, &[done(486)], 0, code(486)), RelayDecision::Discard);
        let non_invite = RelayContext { uas_final: true, ..Default::default() };
        assert_eq!(decide(non_invite, &[done(200)], 0, code(200)), RelayDecision::Discard);
    }

    #[test]
    fn picking_order() {
        assert_eq!(pick_branch(&[done(486), done(302), done(404)], false, false), Some(1));
        assert_eq!(pick_branch(&[done(503), done(500)], false, false), Some(1));
        assert_eq!(pick_branch(&[done(503), done(604)], false, false), Some(1));
        assert_eq!(pick_branch(&[done(408), done(487)], true, false), Some(1));
        assert_eq!(pick_branch(&[done(404), done(404)], false, false), Some(0));
        assert_eq!(pick_branch(&[open(Some(180))], false, false), None);
        assert_eq!(relayed_code(code(503)), StatusCode::SERVER_INTERNAL_ERROR);
        assert_eq!(relayed_code(code(486)), StatusCode::BUSY_HERE);
    }
}
