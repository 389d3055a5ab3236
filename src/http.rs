use anyhow::Result;
use async_trait::async_trait;
use vipcore::net::{HttpClient, HttpMethod, HttpRequest, HttpResponse};

/// [`HttpClient`] over `ureq`. Requests run on the blocking pool since
/// `ureq` is synchronous.
///
/// Non-2xx statuses come back as responses rather than errors, so the
/// rendezvous poll can tell "nothing yet" from a transport failure.
#[derive(Debug, Clone, Default)]
pub struct UreqHttpClient;

impl UreqHttpClient {
    pub fn new() -> Self {
        Self
    }
}

fn perform(request: HttpRequest) -> Result<HttpResponse> {
    let mut response = match request.method {
        HttpMethod::Get => {
            let mut req = ureq::get(&request.url)
                .config()
                .timeout_global(request.timeout)
                .http_status_as_error(false)
                .build();
            for (key, value) in &request.headers {
                req = req.header(key, value);
            }
            req.call()?
        }
        HttpMethod::Post => {
            let mut req = ureq::post(&request.url)
                .config()
                .timeout_global(request.timeout)
                .http_status_as_error(false)
                .build();
            for (key, value) in &request.headers {
                req = req.header(key, value);
            }
            match &request.body {
                Some(body) => req.send(&body[..])?,
                None => req.send_empty()?,
            }
        }
    };
    Ok(HttpResponse {
        status_code: response.status().as_u16(),
        body: response.body_mut().read_to_vec()?,
    })
}

#[async_trait]
impl HttpClient for UreqHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        tokio::task::spawn_blocking(move || perform(request)).await?
    }
}
