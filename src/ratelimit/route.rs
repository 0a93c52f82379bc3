//! Routes and the bucket keys derived from them.

use http::Method;

/// Prefix of bucket ids that have not been discovered from a response yet.
pub(crate) const UNINIT_BUCKET: &str = "uninit";

/// Which global window a bucket honors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketScope {
    /// Subject to both the account-level and the edge-level limit
    Account,
    /// Subject to the edge-level limit only
    Edge,
}

/// An outbound request target.
///
/// The template (`/channels/{channel_id}/messages`) identifies the rate
/// limit group before the remote has told us its bucket hash. The major
/// parameter splits a shared hash into independent buckets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    method: Method,
    template: String,
    path: String,
    major: Option<String>,
    scope: BucketScope,
}

impl Route {
    /// Create a route whose path is the template itself.
    pub fn new(method: Method, template: impl Into<String>) -> Self {
        let template = template.into();
        Self {
            method,
            path: template.clone(),
            template,
            major: None,
            scope: BucketScope::Account,
        }
    }

    /// Substitute the `{placeholder}` segments of the template, in order.
    ///
    /// Placeholders without a matching parameter are left as they are.
    pub fn compile<S: AsRef<str>>(mut self, params: &[S]) -> Self {
        let mut path = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();
        let mut params = params.iter();

        while let Some(start) = rest.find('{') {
            let Some(len) = rest[start..].find('}') else {
                break;
            };
            path.push_str(&rest[..start]);
            match params.next() {
                Some(value) => path.push_str(value.as_ref()),
                None => path.push_str(&rest[start..=start + len]),
            }
            rest = &rest[start + len + 1..];
        }
        path.push_str(rest);

        self.path = path;
        self
    }

    /// Set the major parameter.
    pub fn with_major(mut self, major: impl Into<String>) -> Self {
        self.major = Some(major.into());
        self
    }

    /// Mark this route as only subject to the edge-level global limit.
    pub fn interaction(mut self) -> Self {
        self.scope = BucketScope::Edge;
        self
    }

    /// The HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The uncompiled path template.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// The compiled path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The major parameter, if any.
    pub fn major(&self) -> Option<&str> {
        self.major.as_deref()
    }

    /// Global scope of the bucket this route ends up in.
    pub fn scope(&self) -> BucketScope {
        self.scope
    }

    /// Key of the route's rate limit group, independent of parameters.
    pub(crate) fn group_key(&self) -> String {
        format!("{} {}", self.method, self.template)
    }

    /// Id of the bucket this route belongs to, given its discovered hash.
    pub(crate) fn bucket_id(&self, hash: Option<&str>) -> String {
        let base = match hash {
            Some(hash) => hash.to_string(),
            None => format!("{}+{}", UNINIT_BUCKET, self.group_key()),
        };
        match &self.major {
            Some(major) => format!("{}:{}", base, major),
            None => base,
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}
