//! Per-tenant system instructions for the AI backend.

use crate::error::VoiceError;
use crate::BoxFuture;
use callbridge_types::TenantConfig;

/// Supplies the backend's system instructions for a tenant.
///
/// Invoked once when a call session starts. The returned text is opaque to
/// the bridge.
pub trait PromptBuilder: Send + Sync {
    fn build<'a>(&'a self, tenant: &'a TenantConfig) -> BoxFuture<'a, Result<String, VoiceError>>;
}

/// Renders instructions from the tenant config alone.
///
/// Business context is referenced by id so the backend's tool calls can ask
/// the business-data service for it on demand.
#[derive(Debug, Clone, Default)]
pub struct TemplatePromptBuilder;

impl TemplatePromptBuilder {
    pub fn render(tenant: &TenantConfig) -> String {
        let mut out = format!(
            "You are {}, a friendly phone receptionist. Keep answers short and \
             conversational; the caller is on a phone line.",
            tenant.assistant_name
        );
        if let Some(greeting) = &tenant.greeting {
            out.push_str(&format!(" Open the call with: \"{}\".", greeting));
        }
        if let Some(context_ref) = &tenant.context_ref {
            out.push_str(&format!(
                " Business details are available under reference `{}`.",
                context_ref
            ));
        }
        out.push_str(
            " Use save_note for anything the business should follow up on, \
             create_lead when the caller wants to be contacted, and end_call once \
             the caller says goodbye.",
        );
        out
    }
}

impl PromptBuilder for TemplatePromptBuilder {
    fn build<'a>(&'a self, tenant: &'a TenantConfig) -> BoxFuture<'a, Result<String, VoiceError>> {
        Box::pin(async move { Ok(Self::render(tenant)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantConfig {
        TenantConfig {
            tenant_id: "acme".into(),
            assistant_name: "Ava".into(),
            voice: "alloy".into(),
            greeting: Some("Thanks for calling Acme".into()),
            context_ref: Some("biz/acme".into()),
        }
    }

    #[tokio::test]
    async fn includes_name_greeting_and_context() {
        let text = TemplatePromptBuilder.build(&tenant()).await.unwrap();
        assert!(text.contains("You are Ava"));
        assert!(text.contains("Thanks for calling Acme"));
        assert!(text.contains("biz/acme"));
    }

    #[test]
    fn optional_parts_are_omitted() {
        let mut t = tenant();
        t.greeting = None;
        t.context_ref = None;
        let text = TemplatePromptBuilder::render(&t);
        assert!(!text.contains("Open the call"));
        assert!(!text.contains("reference"));
    }
}
