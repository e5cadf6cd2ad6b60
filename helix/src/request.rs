//! Request and response values exchanged with the caller's handler.

use bytes::Bytes;
use helix_h2::HeaderField;

use crate::error::HandlerError;

/// Header map for one stream.
///
/// Names are kept as received and arrival order is preserved. Repeating a
/// name replaces its value in place, except `cookie`, whose crumbs are
/// re-joined with `"; "`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some((_, existing)) if name.eq_ignore_ascii_case("cookie") => {
                existing.push_str("; ");
                existing.push_str(&value);
            }
            Some((_, existing)) => *existing = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge a decoded header block, e.g. request headers or trailers.
    pub(crate) fn extend_fields(&mut self, fields: Vec<HeaderField>) {
        for field in fields {
            self.insert(
                String::from_utf8_lossy(&field.name),
                String::from_utf8_lossy(&field.value),
            );
        }
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// A complete request, handed to the handler once the peer half-closes.
#[derive(Debug, Clone)]
pub struct Request {
    /// Identifies the stream the response is sent on.
    pub stream_id: u32,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn method(&self) -> Option<&str> {
        self.headers.get(":method")
    }

    pub fn path(&self) -> Option<&str> {
        self.headers.get(":path")
    }

    pub fn authority(&self) -> Option<&str> {
        self.headers.get(":authority")
    }

    pub fn scheme(&self) -> Option<&str> {
        self.headers.get(":scheme")
    }
}

/// A handler's answer. `headers` must carry `:status`.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub headers: Headers,
    pub body: Option<Bytes>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        let mut buf = itoa::Buffer::new();
        let mut headers = Headers::new();
        headers.insert(":status", buf.format(status));
        Response {
            headers,
            body: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn status(&self) -> Option<&str> {
        self.headers.get(":status")
    }

    /// Body to send, if any. An empty body counts as none.
    pub(crate) fn payload(&self) -> Option<&Bytes> {
        self.body.as_ref().filter(|b| !b.is_empty())
    }

    /// Header block for the wire: `:status` first, pseudo-headers before
    /// regular ones, names lowercased, `content-length` added for a body.
    pub(crate) fn header_fields(&self) -> Result<Vec<HeaderField>, HandlerError> {
        let status = self.status().ok_or("response has no :status header")?;
        let mut fields = vec![HeaderField::new(":status", status)];
        let (pseudo, regular): (Vec<_>, Vec<_>) = self
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case(":status"))
            .partition(|(name, _)| name.starts_with(':'));
        for (name, value) in pseudo.into_iter().chain(regular) {
            fields.push(HeaderField::new(name.to_ascii_lowercase(), value));
        }
        if let Some(body) = self.payload()
            && !self.headers.contains("content-length")
        {
            let mut buf = itoa::Buffer::new();
            fields.push(HeaderField::new("content-length", buf.format(body.len())));
        }
        Ok(fields)
    }
}

/// Answers requests. Called synchronously on the reactor thread.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: &Request) -> Result<Response, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&Request) -> Result<Response, HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, request: &Request) -> Result<Response, HandlerError> {
        self(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(fields: &[HeaderField]) -> Vec<String> {
        fields
            .iter()
            .map(|f| String::from_utf8_lossy(&f.name).into_owned())
            .collect()
    }

    #[test]
    fn duplicate_names_last_write_wins_in_place() {
        let mut headers = Headers::new();
        headers.insert("accept", "text/html");
        headers.insert("x-id", "1");
        headers.insert("accept", "application/json");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("accept"), Some("application/json"));
        let order: Vec<_> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(order, vec!["accept", "x-id"]);
    }

    #[test]
    fn cookie_crumbs_are_joined() {
        let headers: Headers = [("cookie", "a=1"), ("cookie", "b=2"), ("cookie", "c=3")]
            .into_iter()
            .collect();
        assert_eq!(headers.get("cookie"), Some("a=1; b=2; c=3"));
    }

    #[test]
    fn lookup_ignores_case_and_keeps_name() {
        let mut headers = Headers::new();
        headers.insert("X-Trace", "abc");
        assert_eq!(headers.get("x-trace"), Some("abc"));
        assert_eq!(headers.iter().next(), Some(("X-Trace", "abc")));
    }

    #[test]
    fn trailers_merge_into_headers() {
        let mut headers = Headers::new();
        headers.extend_fields(vec![
            HeaderField::new(":method", "POST"),
            HeaderField::new("grpc-status", "pending"),
        ]);
        headers.extend_fields(vec![HeaderField::new("grpc-status", "0")]);
        assert_eq!(headers.get("grpc-status"), Some("0"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn request_pseudo_accessors() {
        let request = Request {
            stream_id: 1,
            headers: [(":method", "GET"), (":path", "/"), (":authority", "localhost")]
                .into_iter()
                .collect(),
            body: Bytes::new(),
        };
        assert_eq!(request.method(), Some("GET"));
        assert_eq!(request.path(), Some("/"));
        assert_eq!(request.authority(), Some("localhost"));
        assert_eq!(request.scheme(), None);
    }

    #[test]
    fn status_goes_first_and_length_is_added() {
        let response = Response::new(200)
            .header("Content-Type", "text/plain")
            .body("TEST DATA");
        let fields = response.header_fields().unwrap();
        assert_eq!(
            names(&fields),
            vec![":status", "content-type", "content-length"]
        );
        assert_eq!(fields[0].value, b"200");
        assert_eq!(fields[2].value, b"9");
    }

    #[test]
    fn explicit_content_length_is_kept() {
        let response = Response::new(200)
            .header("content-length", "9")
            .body("TEST DATA");
        let fields = response.header_fields().unwrap();
        assert_eq!(
            fields.iter().filter(|f| f.name == b"content-length").count(),
            1
        );
    }

    #[test]
    fn empty_body_is_no_body() {
        let response = Response::new(204).body(Bytes::new());
        assert!(response.payload().is_none());
        let fields = response.header_fields().unwrap();
        assert_eq!(names(&fields), vec![":status"]);
    }

    #[test]
    fn missing_status_is_an_error() {
        let response = Response {
            headers: [("content-type", "text/plain")].into_iter().collect(),
            body: None,
        };
        assert!(response.header_fields().is_err());
    }

    #[test]
    fn closures_are_handlers() {
        let handler = |req: &Request| -> Result<Response, HandlerError> {
            Ok(Response::new(200).body(req.body.clone()))
        };
        let request = Request {
            stream_id: 3,
            headers: Headers::new(),
            body: Bytes::from_static(b"echo"),
        };
        let response = handler.handle(&request).unwrap();
        assert_eq!(response.body.as_deref(), Some(&b"echo"[..]));
    }
}
