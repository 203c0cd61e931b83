use serde::Serialize;

/// Renders command results as pretty JSON for people or one JSON line per
/// response for scripts.
pub struct Output {
    json: bool,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn success<T: Serialize>(&self, command: &str, data: T) {
        if self.json {
            println!(
                "{}",
                render(
                    &JsonResponse {
                        status: "ok",
                        command,
                        data: Some(data),
                        error: None,
                    },
                    false
                )
            );
        } else {
            println!("{}", render(&data, true));
        }
    }

    pub fn success_message(&self, command: &str, message: &str) {
        if self.json {
            self.success(command, serde_json::json!({ "message": message }));
        } else {
            println!("{}", message);
        }
    }

    pub fn error(&self, message: &str) {
        if self.json {
            let response: JsonResponse<()> = JsonResponse {
                status: "error",
                command: "",
                data: None,
                error: Some(message.to_string()),
            };
            eprintln!("{}", render(&response, false));
        } else {
            eprintln!("Error: {}", message);
        }
    }
}

fn render<T: Serialize>(value: &T, pretty: bool) -> String {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    rendered.unwrap_or_else(|e| format!("{{\"status\":\"error\",\"error\":\"{}\"}}", e))
}

#[derive(Serialize)]
struct JsonResponse<'a, T: Serialize> {
    status: &'a str,
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}
