use serde::Serialize;

use crate::dispatch::registry::ProviderStatus;

#[derive(Serialize)]
pub struct ProviderInfo {
    pub name: &'static str,
    pub configured: bool,
    pub key_env: Option<&'static str>,
    pub capabilities: Vec<&'static str>,
}

impl From<&ProviderStatus> for ProviderInfo {
    fn from(status: &ProviderStatus) -> Self {
        Self {
            name: status.kind.as_str(),
            configured: status.configured,
            key_env: status.key_env,
            capabilities: status.capabilities.iter().map(|c| c.as_str()).collect(),
        }
    }
}

#[derive(Serialize)]
pub struct ListProvidersResponse {
    pub providers: Vec<ProviderInfo>,
}

impl ListProvidersResponse {
    /// Markdown table, configured providers first.
    pub fn to_markdown(&self) -> String {
        let mut rows: Vec<&ProviderInfo> = self.providers.iter().collect();
        rows.sort_by_key(|p| (!p.configured, p.name));

        let mut out = String::from("| provider | ready | capabilities | key |\n|---|---|---|---|\n");
        for p in rows {
            let ready = if p.configured { "yes" } else { "no" };
            let key = p.key_env.map_or_else(|| "-".to_string(), |k| format!("`{k}`"));
            out.push_str(&format!(
                "| {} | {ready} | {} | {key} |\n",
                p.name,
                p.capabilities.join(", ")
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &'static str, configured: bool, key_env: Option<&'static str>) -> ProviderInfo {
        ProviderInfo {
            name,
            configured,
            key_env,
            capabilities: vec!["chat"],
        }
    }

    #[test]
    fn configured_rows_come_first() {
        let list = ListProvidersResponse {
            providers: vec![
                info("xai", false, Some("XAI_API_KEY")),
                info("ollama", true, None),
            ],
        };
        let md = list.to_markdown();
        let ollama = md.find("| ollama | yes | chat | - |").unwrap();
        let xai = md.find("| xai | no | chat | `XAI_API_KEY` |").unwrap();
        assert!(ollama < xai);
    }
}
