//! Builders for multipart bodies used by tests in this and downstream crates.

const BOUNDARY: &str = "csvdrop-test-boundary-7MA4YWxkTrZu0gW";

#[derive(Debug, Default)]
pub struct MultipartBody {
    body: Vec<u8>,
}

impl MultipartBody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={BOUNDARY}")
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.open_part(&format!("form-data; name=\"{name}\""), None);
        self.body.extend_from_slice(value.as_bytes());
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn file(mut self, name: &str, file_name: &str, content_type: &str, payload: &[u8]) -> Self {
        self.open_part(
            &format!("form-data; name=\"{name}\"; filename=\"{file_name}\""),
            Some(content_type),
        );
        self.body.extend_from_slice(payload);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn untyped_file(mut self, name: &str, file_name: &str, payload: &[u8]) -> Self {
        self.open_part(
            &format!("form-data; name=\"{name}\"; filename=\"{file_name}\""),
            None,
        );
        self.body.extend_from_slice(payload);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.body
            .extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        self.body
    }

    fn open_part(&mut self, disposition: &str, content_type: Option<&str>) {
        self.body
            .extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        self.body
            .extend_from_slice(format!("Content-Disposition: {disposition}\r\n").as_bytes());
        if let Some(content_type) = content_type {
            self.body
                .extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        self.body.extend_from_slice(b"\r\n");
    }
}
