//! Generic caveat satisfaction engine.
//!
//! A [`Satisfier`] is registered per concrete condition name. [`SatisfierRegistry::verify`]
//! groups a macaroon's caveats by condition, preserving order, and for each
//! group with a registered satisfier enforces monotonic attenuation between
//! successive caveats plus a terminal acceptance check on the last one.
//! Caveats whose condition has no registered satisfier are ignored — an
//! opaque extensibility point, per the design.

use crate::caveat::{decode_services, Caveat, COND_CAPABILITIES_SUFFIX, COND_SERVICES, COND_TIMEOUT_SUFFIX};

/// A condition-specific attenuation and terminal-acceptance rule.
pub struct Satisfier {
    pub condition: String,
    pub check_attenuation: Box<dyn Fn(&Caveat, &Caveat) -> Result<(), String> + Send + Sync>,
    pub check_final: Box<dyn Fn(&Caveat) -> Result<(), String> + Send + Sync>,
}

/// Evaluates sequences of caveats under a set of registered satisfiers.
#[derive(Default)]
pub struct SatisfierRegistry {
    satisfiers: Vec<Satisfier>,
}

impl SatisfierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, satisfier: Satisfier) -> &mut Self {
        self.satisfiers.push(satisfier);
        self
    }

    /// Verifies `caveats` against all registered satisfiers. Caveats are
    /// grouped by condition, preserving their original relative order within
    /// each group.
    pub fn verify(&self, caveats: &[Caveat]) -> Result<(), String> {
        for satisfier in &self.satisfiers {
            let group: Vec<&Caveat> = caveats
                .iter()
                .filter(|c| c.condition == satisfier.condition)
                .collect();

            if group.is_empty() {
                continue;
            }

            for pair in group.windows(2) {
                (satisfier.check_attenuation)(pair[0], pair[1])?;
            }

            let last = group.last().expect("non-empty group");
            (satisfier.check_final)(last)?;
        }
        Ok(())
    }
}

/// Determines whether the target service is authorized for a given L402.
pub fn services_satisfier(target_service: &str) -> Satisfier {
    let target = target_service.to_string();
    Satisfier {
        condition: COND_SERVICES.to_string(),
        check_attenuation: Box::new(|prev, cur| {
            let prev_services = decode_services(&prev.value).map_err(|e| e.to_string())?;
            let allowed: std::collections::HashSet<&str> =
                prev_services.iter().map(|s| s.name.as_str()).collect();

            let cur_services = decode_services(&cur.value).map_err(|e| e.to_string())?;
            for service in &cur_services {
                if !allowed.contains(service.name.as_str()) {
                    return Err(format!("service {} not previously allowed", service.name));
                }
            }
            Ok(())
        }),
        check_final: Box::new(move |c| {
            let services = decode_services(&c.value).map_err(|e| e.to_string())?;
            if services.iter().any(|s| s.name == target) {
                Ok(())
            } else {
                Err(format!("target service {} not authorized", target))
            }
        }),
    }
}

/// Enforces attenuation on a service's capabilities caveat without requiring
/// a specific target capability. Used when a caller asks only "is this
/// service authorized" and a capabilities caveat happens to be attached: the
/// chain must still only ever narrow, but there is no capability to check the
/// final caveat against.
pub fn capabilities_attenuation_satisfier(service: &str) -> Satisfier {
    Satisfier {
        condition: format!("{service}{COND_CAPABILITIES_SUFFIX}"),
        check_attenuation: Box::new(|prev, cur| {
            let allowed: std::collections::HashSet<&str> = prev.value.split(',').collect();
            for capability in cur.value.split(',') {
                if !allowed.contains(capability) {
                    return Err(format!("capability {capability} not previously allowed"));
                }
            }
            Ok(())
        }),
        check_final: Box::new(|_| Ok(())),
    }
}

/// Determines whether the target capability for a service is authorized.
pub fn capabilities_satisfier(service: &str, target_capability: &str) -> Satisfier {
    let target = target_capability.to_string();
    Satisfier {
        condition: format!("{service}{COND_CAPABILITIES_SUFFIX}"),
        check_attenuation: Box::new(|prev, cur| {
            let allowed: std::collections::HashSet<&str> = prev.value.split(',').collect();
            for capability in cur.value.split(',') {
                if !allowed.contains(capability) {
                    return Err(format!("capability {capability} not previously allowed"));
                }
            }
            Ok(())
        }),
        check_final: Box::new(move |c| {
            if c.value.split(',').any(|cap| cap == target) {
                Ok(())
            } else {
                Err(format!("target capability {target} not authorized"))
            }
        }),
    }
}

/// Checks if an L402 is expired, comparing against `now` (a Unix timestamp
/// producer, seconds). Each subsequent caveat of the same condition is only
/// permitted to tighten the expiration, never loosen it.
pub fn timeout_satisfier(service: &str, now: impl Fn() -> i64 + Send + Sync + 'static) -> Satisfier {
    Satisfier {
        condition: format!("{service}{COND_TIMEOUT_SUFFIX}"),
        check_attenuation: Box::new(|prev, cur| {
            let prev_ts: i64 = prev.value.parse().map_err(|_| "error parsing previous caveat value".to_string())?;
            let cur_ts: i64 = cur.value.parse().map_err(|_| "error parsing caveat value".to_string())?;
            if prev_ts < cur_ts {
                Err(format!("{service}{COND_TIMEOUT_SUFFIX} caveat violates increasing restrictiveness"))
            } else {
                Ok(())
            }
        }),
        check_final: Box::new(move |c| {
            let expiry: i64 = c.value.parse().map_err(|_| "caveat value not a valid integer".to_string())?;
            if now() < expiry {
                Ok(())
            } else {
                Err("not authorized to access service. L402 has expired".to_string())
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services_caveat(services: &[(&str, u8)]) -> Caveat {
        let value = services
            .iter()
            .map(|(n, t)| format!("{n}:{t}"))
            .collect::<Vec<_>>()
            .join(",");
        Caveat::new(COND_SERVICES, value)
    }

    #[test]
    fn services_attenuation_allows_narrowing() {
        let mut reg = SatisfierRegistry::new();
        reg.register(services_satisfier("a"));

        let caveats = vec![
            services_caveat(&[("a", 0), ("b", 0)]),
            services_caveat(&[("a", 0)]),
        ];
        assert!(reg.verify(&caveats).is_ok());
    }

    #[test]
    fn services_attenuation_rejects_widening() {
        let mut reg = SatisfierRegistry::new();
        reg.register(services_satisfier("b"));

        let caveats = vec![
            services_caveat(&[("a", 0)]),
            services_caveat(&[("a", 0), ("b", 0)]),
        ];
        let err = reg.verify(&caveats).unwrap_err();
        assert!(err.contains("not previously allowed"));
    }

    #[test]
    fn services_final_requires_target() {
        let mut reg = SatisfierRegistry::new();
        reg.register(services_satisfier("b"));

        let caveats = vec![services_caveat(&[("a", 0)])];
        assert!(reg.verify(&caveats).is_err());
    }

    #[test]
    fn capabilities_attenuation_and_final() {
        let mut reg = SatisfierRegistry::new();
        reg.register(capabilities_satisfier("demo", "read"));

        let caveats = vec![
            Caveat::new("demo_capabilities", "read,write"),
            Caveat::new("demo_capabilities", "read"),
        ];
        assert!(reg.verify(&caveats).is_ok());

        let widened = vec![
            Caveat::new("demo_capabilities", "read"),
            Caveat::new("demo_capabilities", "read,write"),
        ];
        assert!(reg.verify(&widened).is_err());
    }

    #[test]
    fn timeout_equal_prev_curr_accepted() {
        let mut reg = SatisfierRegistry::new();
        reg.register(timeout_satisfier("demo", || 0));

        let caveats = vec![
            Caveat::new("demo_valid_until", "100"),
            Caveat::new("demo_valid_until", "100"),
        ];
        assert!(reg.verify(&caveats).is_ok());
    }

    #[test]
    fn timeout_extension_rejected() {
        let mut reg = SatisfierRegistry::new();
        reg.register(timeout_satisfier("demo", || 0));

        let caveats = vec![
            Caveat::new("demo_valid_until", "100"),
            Caveat::new("demo_valid_until", "200"),
        ];
        let err = reg.verify(&caveats).unwrap_err();
        assert!(err.contains("increasing restrictiveness"));
    }

    #[test]
    fn timeout_expired_rejected() {
        let mut reg = SatisfierRegistry::new();
        reg.register(timeout_satisfier("demo", || 1_000));

        let caveats = vec![Caveat::new("demo_valid_until", "999")];
        assert!(reg.verify(&caveats).is_err());
    }

    #[test]
    fn unregistered_condition_is_ignored() {
        let reg = SatisfierRegistry::new();
        let caveats = vec![Caveat::new("unknown", "whatever")];
        assert!(reg.verify(&caveats).is_ok());
    }
}
