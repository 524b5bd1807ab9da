//! Deciding whether a navigation may proceed
//!
//! Before every route transition the guard looks at one fact, whether the
//! session holds an access token, and at what kind of route is being
//! entered:
//!
//! | Has token | Target class | Decision |
//! |---|---|---|
//! | no | public auth route | allow |
//! | no | protected route | redirect to sign-in |
//! | no | other | allow |
//! | yes | public auth route | redirect to home |
//! | yes | protected or other | allow |
//!
//! Token expiry is not considered. An expired token still counts as
//! present; it is refreshed or discarded the next time it is used.
//!
//! ```
//! use tessera_guard::{Decision, NavigationGuard, Route};
//!
//! let guard = NavigationGuard::default();
//!
//! assert_eq!(guard.check(false, &Route::named("SignIn")), Decision::Allow);
//! assert_eq!(
//!     guard.check(false, &Route::named("Home")),
//!     Decision::Redirect("/signin".into())
//! );
//! assert_eq!(
//!     guard.check(true, &Route::named("SignUp")),
//!     Decision::Redirect("/".into())
//! );
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{borrow::Cow, collections::BTreeSet};

/// A navigation target
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    name: Cow<'static, str>,
    requires_auth: bool,
}

impl Route {
    /// A route with the given name and no auth requirement
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            requires_auth: false,
        }
    }

    /// Marks the route as requiring a session
    pub fn requiring_auth(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    /// The route name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the route is flagged as requiring a session
    #[inline]
    pub fn requires_auth(&self) -> bool {
        self.requires_auth
    }
}

/// How the guard treats a route
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RouteClass {
    /// Sign-in, sign-up, and the login callback; pointless with a session
    PublicAuth,
    /// Requires a session
    Protected,
    /// Open to everyone
    Other,
}

/// The outcome of a guard check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Proceed to the target
    Allow,
    /// Navigate to the given path instead
    Redirect(String),
}

/// The pure decision rule
///
/// Returns `None` to allow the navigation, otherwise where to go instead.
pub fn decide(has_token: bool, class: RouteClass) -> Option<Redirect> {
    match (has_token, class) {
        (false, RouteClass::Protected) => Some(Redirect::SignIn),
        (true, RouteClass::PublicAuth) => Some(Redirect::Home),
        _ => None,
    }
}

/// Where a refused navigation is sent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Redirect {
    /// The sign-in page
    SignIn,
    /// The home page
    Home,
}

/// A configurable navigation guard
#[derive(Clone, Debug)]
pub struct NavigationGuard {
    public_auth: BTreeSet<Cow<'static, str>>,
    protected: BTreeSet<Cow<'static, str>>,
    sign_in_path: String,
    home_path: String,
}

impl Default for NavigationGuard {
    fn default() -> Self {
        Self {
            public_auth: ["SignIn", "SignUp", "AuthCallback"]
                .into_iter()
                .map(Cow::Borrowed)
                .collect(),
            protected: std::iter::once(Cow::Borrowed("Home")).collect(),
            sign_in_path: "/signin".to_owned(),
            home_path: "/".to_owned(),
        }
    }
}

impl NavigationGuard {
    /// Replaces the names of routes that only make sense without a session
    pub fn with_public_auth_routes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Cow<'static, str>>,
    {
        self.public_auth = names.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the names of routes that always require a session
    ///
    /// Routes flagged with [`Route::requiring_auth()`] are protected
    /// regardless.
    pub fn with_protected_routes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Cow<'static, str>>,
    {
        self.protected = names.into_iter().map(Into::into).collect();
        self
    }

    /// Sets where visitors without a session are sent
    pub fn with_sign_in_path(mut self, path: impl Into<String>) -> Self {
        self.sign_in_path = path.into();
        self
    }

    /// Sets where visitors with a session are sent
    pub fn with_home_path(mut self, path: impl Into<String>) -> Self {
        self.home_path = path.into();
        self
    }

    /// Classifies a route
    ///
    /// Public auth names win over the protected flag.
    pub fn classify(&self, route: &Route) -> RouteClass {
        if self.public_auth.contains(route.name()) {
            RouteClass::PublicAuth
        } else if route.requires_auth() || self.protected.contains(route.name()) {
            RouteClass::Protected
        } else {
            RouteClass::Other
        }
    }

    /// Decides whether navigating to `route` may proceed
    pub fn check(&self, has_token: bool, route: &Route) -> Decision {
        let class = self.classify(route);
        let decision = match decide(has_token, class) {
            None => Decision::Allow,
            Some(Redirect::SignIn) => Decision::Redirect(self.sign_in_path.clone()),
            Some(Redirect::Home) => Decision::Redirect(self.home_path.clone()),
        };

        tracing::debug!(
            route = route.name(),
            has_token,
            ?class,
            ?decision,
            "checked navigation"
        );
        decision
    }
}

/// Maps paths to routes
///
/// Paths that match nothing resolve to the not-found route.
#[derive(Clone, Debug)]
pub struct RouteTable {
    routes: Vec<(String, Route)>,
    not_found: Route,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(Route::named("NotFound"))
            .with_route("/", Route::named("Home").requiring_auth())
            .with_route("/signin", Route::named("SignIn"))
            .with_route("/signup", Route::named("SignUp"))
            .with_route("/auth/validation", Route::named("AuthCallback"))
            .with_route("/404", Route::named("NotFound"))
    }
}

impl RouteTable {
    /// An empty table resolving everything to `not_found`
    pub fn new(not_found: Route) -> Self {
        Self {
            routes: Vec::new(),
            not_found,
        }
    }

    /// Adds a route at an exact path
    pub fn with_route(mut self, path: impl Into<String>, route: Route) -> Self {
        self.routes.push((path.into(), route));
        self
    }

    /// Resolves a path, ignoring any query string, fragment, or trailing
    /// slash
    pub fn resolve(&self, path: &str) -> &Route {
        let path = path
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        let trimmed = match path.trim_end_matches('/') {
            "" => "/",
            p => p,
        };

        self.routes
            .iter()
            .find(|(p, _)| p == trimmed)
            .map_or(&self.not_found, |(_, route)| route)
    }
}
