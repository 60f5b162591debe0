/// Builds the bracket-notation query strings the REST API expects
/// (`filter[updatedAfter]=…`, `page[offset]=…`). Keys with no value are
/// simply never added — there is no explicit "undefined" to skip.
#[derive(Debug, Default, Clone)]
pub struct Query(Vec<(String, String)>);

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn filter(self, key: &str, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.field(format!("filter[{key}]"), v),
            None => self,
        }
    }

    #[must_use]
    pub fn page(self, offset: Option<u64>, limit: Option<u64>) -> Self {
        let q = match offset {
            Some(o) => self.field("page[offset]", o.to_string()),
            None => self,
        };
        match limit {
            Some(l) => q.field("page[limit]", l.to_string()),
            None => q,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_pairs(&self) -> &[(String, String)] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_bracketed_keys() {
        let q = Query::new()
            .filter("updatedAfter", Some("2020-01-01"))
            .page(Some(0), Some(50));
        assert_eq!(
            q.as_pairs(),
            &[
                ("filter[updatedAfter]".to_string(), "2020-01-01".to_string()),
                ("page[offset]".to_string(), "0".to_string()),
                ("page[limit]".to_string(), "50".to_string()),
            ]
        );
    }

    #[test]
    fn skips_absent_filters() {
        let q = Query::new().filter::<&str>("search", None);
        assert!(q.is_empty());
    }
}
