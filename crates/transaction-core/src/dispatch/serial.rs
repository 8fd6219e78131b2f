use super::Target;

/// q-value assumed for targets without one
pub const DEFAULT_Q: f32 = 1.0;

/// Group targets for serial forking: descending q-value, targets with equal
/// q in one group (tried in parallel), input order kept within a group.
pub fn group_by_q(targets: &[Target]) -> Vec<Vec<Target>> {
    let mut sorted: Vec<&Target> = targets.iter().collect();
    sorted.sort_by(|a, b| {
        let qa = a.q.unwrap_or(DEFAULT_Q);
        let qb = b.q.unwrap_or(DEFAULT_Q);
        qb.total_cmp(&qa)
    });

    let mut groups: Vec<Vec<Target>> = Vec::new();
    let mut current_q: Option<f32> = None;
    for target in sorted {
        let q = target.q.unwrap_or(DEFAULT_Q);
        match (groups.last_mut(), current_q) {
            (Some(group), Some(prev)) if prev == q => group.push(target.clone()),
            _ => {
                groups.push(vec![target.clone()]);
                current_q = Some(q);
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(uri: &str, q: Option<f32>) -> Target {
        let target = Target::parse(uri).unwrap();
        match q {
            Some(q) => target.with_q(q),
            None => target,
        }
    }

    #[test]
    fn groups_descending() {
        let groups = group_by_q(&[
            t("sip:a@192.0.2.1", Some(0.5)),
            t("sip:b@192.0.2.2", None),
            t("sip:c@192.0.2.3", Some(0.5)),
            t("sip:d@192.0.2.4", Some(0.9)),
        ]);
        let hosts: Vec<Vec<&str>> = groups
            .iter()
            .map(|g| g.iter().map(|t| t.uri.user.as_deref().unwrap_or("")).collect())
            .collect();
        assert_eq!(hosts, vec![vec!["b"], vec!["d"], vec!["a", "c"]]);
    }

    #[test]
    fn empty_input() {
        assert!(group_by_q(&[]).is_empty());
    }
}
