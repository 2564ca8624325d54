//! Capability checking pipeline.
//!
//! Authorization is expressed as an ordered list of named checkers applied
//! to every required scope. For a single scope, *all* configured checkers
//! must allow — they compose conjunctively, so operators can bolt on
//! additional constraints (IP allowlists, emergency lockdowns) without
//! touching the decision engine. Across the scopes required by one request,
//! the `satisfy` strategy picks between `all` (every scope must pass) and
//! `any` (first passing scope wins).
//!
//! Checkers are looked up by name from a static table when the pipeline is
//! built; an unknown name in `access_checks` fails startup, never a request.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use crate::config::Config;
use crate::jwt::Claims;
use crate::{Error, Result};

/// Strategy for combining multiple required scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Satisfy {
    /// Every required scope must pass (the default).
    #[default]
    All,
    /// One passing scope is enough.
    Any,
}

impl Satisfy {
    /// The wire form used in query parameters and response headers.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Any => "any",
        }
    }
}

impl FromStr for Satisfy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Self::All),
            "any" => Ok(Self::Any),
            other => Err(Error::InvalidRequest(format!(
                "satisfy must be \"any\" or \"all\", got \"{other}\""
            ))),
        }
    }
}

/// Outcome of a capability check.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Whether access is allowed.
    pub allowed: bool,
    /// Human-readable reason, surfaced in 403 bodies on denial.
    pub reason: String,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: "Success".to_string(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// A single named access checker.
trait AccessChecker: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, scope: &str, claims: &Claims) -> Decision;
}

/// Allows a scope that appears verbatim in the token's `scope` claim.
struct ScopeChecker;

impl AccessChecker for ScopeChecker {
    fn name(&self) -> &'static str {
        "scope"
    }

    fn check(&self, scope: &str, claims: &Claims) -> Decision {
        if claims.has_scope(scope) {
            Decision::allow()
        } else {
            Decision::deny(format!("Missing required scope: {scope}"))
        }
    }
}

/// Allows a scope held directly *or* implied by group membership through the
/// configured group mapping.
struct GroupMembershipChecker {
    group_mapping: HashMap<String, String>,
}

impl AccessChecker for GroupMembershipChecker {
    fn name(&self) -> &'static str {
        "group_membership"
    }

    fn check(&self, scope: &str, claims: &Claims) -> Decision {
        if claims.has_scope(scope) {
            return Decision::allow();
        }
        if let Some(group) = self.group_mapping.get(scope) {
            if claims.groups.iter().any(|g| &g.name == group) {
                return Decision::allow();
            }
        }
        Decision::deny(format!(
            "No group in isMemberOf grants {scope}, and it is not in scope"
        ))
    }
}

/// Names of all registered checkers, for diagnostics.
pub const CHECKER_NAMES: &[&str] = &["scope", "group_membership"];

fn build_checker(name: &str, config: &Config) -> Result<Box<dyn AccessChecker>> {
    match name {
        "scope" => Ok(Box::new(ScopeChecker)),
        "group_membership" => Ok(Box::new(GroupMembershipChecker {
            group_mapping: config.group_mapping.clone(),
        })),
        other => Err(Error::Config(format!(
            "Unknown access check \"{other}\" (registered: {})",
            CHECKER_NAMES.join(", ")
        ))),
    }
}

/// The compiled checker pipeline.
pub struct AccessPipeline {
    checkers: Vec<Box<dyn AccessChecker>>,
    group_mapping: HashMap<String, String>,
}

impl AccessPipeline {
    /// Compile the pipeline from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `access_checks` names an unregistered
    /// checker or is empty.
    pub fn from_config(config: &Config) -> Result<Self> {
        if config.access_checks.is_empty() {
            return Err(Error::Config(
                "access_checks must name at least one checker".to_string(),
            ));
        }
        let checkers = config
            .access_checks
            .iter()
            .map(|name| build_checker(name, config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            checkers,
            group_mapping: config.group_mapping.clone(),
        })
    }

    /// Check one scope: every configured checker must allow.
    #[must_use]
    pub fn check_scope(&self, scope: &str, claims: &Claims) -> Decision {
        for checker in &self.checkers {
            let decision = checker.check(scope, claims);
            tracing::debug!(
                checker = checker.name(),
                scope = scope,
                allowed = decision.allowed,
                "Access check"
            );
            if !decision.allowed {
                return decision;
            }
        }
        Decision::allow()
    }

    /// Evaluate a full request: the required scopes combined by `satisfy`.
    #[must_use]
    pub fn evaluate(&self, required: &[String], satisfy: Satisfy, claims: &Claims) -> Decision {
        let mut reasons = Vec::new();
        let mut passed = 0usize;

        for scope in required {
            let decision = self.check_scope(scope, claims);
            if decision.allowed {
                passed += 1;
                if satisfy == Satisfy::Any {
                    return Decision::allow();
                }
            } else {
                reasons.push(decision.reason);
            }
        }

        let allowed = match satisfy {
            Satisfy::Any => passed > 0,
            Satisfy::All => passed == required.len(),
        };

        if allowed {
            Decision::allow()
        } else {
            Decision::deny(reasons.join(", "))
        }
    }

    /// The token's effective scope set: the `scope` claim plus every scope
    /// implied by group membership. Used for the scopes response header.
    #[must_use]
    pub fn effective_scopes(&self, claims: &Claims) -> BTreeSet<String> {
        let mut scopes: BTreeSet<String> = claims.scopes().into_iter().collect();
        for (scope, group) in &self.group_mapping {
            if claims.groups.iter().any(|g| &g.name == group) {
                scopes.insert(scope.clone());
            }
        }
        scopes
    }
}
