//! IPv4 address utilities: longest-prefix match and router-candidate filtering.

use std::net::Ipv4Addr;

use crate::defaults::default_router_candidates;

/// Builds the two-wave router target lists shared by the NAT-PMP and PCP
/// engines: a first wave combining the router-IP cache with same-/24 local
/// candidates, and a second wave of the remaining default candidates.
pub fn compute_waves(
    router_ip_cache: &[Ipv4Addr],
    local_ips: &[Ipv4Addr],
) -> (Vec<Ipv4Addr>, Vec<Ipv4Addr>) {
    let candidates = default_router_candidates();
    let subnet_matches = filter_router_candidates(&candidates, local_ips);
    let first_wave = arr_union(router_ip_cache, &subnet_matches);
    let second_wave = arr_difference(&candidates, &first_wave);
    (first_wave, second_wave)
}

/// Picks the candidate whose address shares the longest common bit-prefix
/// with `target`. Ties break in favor of the earliest candidate.
///
/// Returns `None` if `candidates` is empty.
pub fn longest_prefix_match(candidates: &[Ipv4Addr], target: Ipv4Addr) -> Option<Ipv4Addr> {
    let target_bits = u32::from(target);
    candidates
        .iter()
        .copied()
        .enumerate()
        .max_by_key(|(i, candidate)| {
            (
                common_prefix_len(u32::from(*candidate), target_bits),
                std::cmp::Reverse(*i),
            )
        })
        .map(|(_, candidate)| candidate)
}

/// Length, in bits, of the common leading prefix of `a` and `b`.
fn common_prefix_len(a: u32, b: u32) -> u32 {
    (a ^ b).leading_zeros()
}

/// Returns the subset of `candidates` whose /24 matches any address in
/// `local_ips`, preserving the order of `candidates`.
pub fn filter_router_candidates(candidates: &[Ipv4Addr], local_ips: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    candidates
        .iter()
        .copied()
        .filter(|candidate| {
            local_ips
                .iter()
                .any(|local| same_slash_24(*candidate, *local))
        })
        .collect()
}

fn same_slash_24(a: Ipv4Addr, b: Ipv4Addr) -> bool {
    let a = a.octets();
    let b = b.octets();
    a[0] == b[0] && a[1] == b[1] && a[2] == b[2]
}

/// Union of two sequences, preserving the order of `a` followed by the
/// not-already-present elements of `b`.
pub fn arr_union(a: &[Ipv4Addr], b: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    let mut out = a.to_vec();
    for item in b {
        if !out.contains(item) {
            out.push(*item);
        }
    }
    out
}

/// Elements of `a` that do not appear in `b`, preserving order.
pub fn arr_difference(a: &[Ipv4Addr], b: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    a.iter().copied().filter(|item| !b.contains(item)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_longest_common_prefix() {
        let candidates = [
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(192, 168, 1, 254),
        ];
        let target = Ipv4Addr::new(192, 168, 1, 50);
        // 192.168.1.1 and 192.168.1.254 share the same /24 with the target;
        // .1 shares more leading bits of the last octet (00000001 vs
        // 00110010) than .254 (11111110 vs 00110010) does.
        let chosen = longest_prefix_match(&candidates, target).unwrap();
        assert_eq!(chosen, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn ties_break_on_earliest_index() {
        // 128.0.0.0 (0b1000...) and 192.0.0.0 (0b1100...) both diverge from
        // 0.0.0.0 at the very first bit, so they tie on common-prefix length
        // (0); the earlier candidate must win.
        let candidates = [Ipv4Addr::new(128, 0, 0, 0), Ipv4Addr::new(192, 0, 0, 0)];
        let target = Ipv4Addr::new(0, 0, 0, 0);
        assert_eq!(
            longest_prefix_match(&candidates, target),
            Some(Ipv4Addr::new(128, 0, 0, 0))
        );
    }

    #[test]
    fn empty_candidates_yields_none() {
        assert_eq!(longest_prefix_match(&[], Ipv4Addr::new(1, 2, 3, 4)), None);
    }

    #[test]
    fn filters_by_slash_24() {
        let candidates = [
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(192, 168, 0, 1),
        ];
        let local = [Ipv4Addr::new(192, 168, 1, 50)];
        let filtered = filter_router_candidates(&candidates, &local);
        assert_eq!(filtered, vec![Ipv4Addr::new(192, 168, 1, 1)]);
    }

    #[test]
    fn compute_waves_prioritizes_cache_then_subnet_then_defaults() {
        let cache = [Ipv4Addr::new(192, 168, 1, 200)];
        let local_ips = [Ipv4Addr::new(192, 168, 1, 50)];
        let (first, second) = compute_waves(&cache, &local_ips);
        assert!(first.contains(&Ipv4Addr::new(192, 168, 1, 200)));
        assert!(first.contains(&Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!second.contains(&Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!first.iter().any(|ip| second.contains(ip)));
    }

    #[test]
    fn union_and_difference_preserve_order_and_dedupe() {
        let a = [Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2)];
        let b = [Ipv4Addr::new(2, 2, 2, 2), Ipv4Addr::new(3, 3, 3, 3)];
        assert_eq!(
            arr_union(&a, &b),
            vec![
                Ipv4Addr::new(1, 1, 1, 1),
                Ipv4Addr::new(2, 2, 2, 2),
                Ipv4Addr::new(3, 3, 3, 3),
            ]
        );
        assert_eq!(arr_difference(&a, &b), vec![Ipv4Addr::new(1, 1, 1, 1)]);
    }
}
