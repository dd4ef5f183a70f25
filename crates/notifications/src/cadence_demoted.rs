use super::template_names;
use anyhow::Context;

pub const KIND: &str = "cadence_demoted";

pub fn register_templates(registry: &mut handlebars::Handlebars<'_>) -> anyhow::Result<()> {
    let (subject, body) = template_names(KIND);
    registry
        .register_template_string(
            &subject,
            r#"Your alert {{{alert.name}}} now runs {{{to}}}"#,
        )
        .context("registering cadence_demoted-subject template")?;

    registry
        .register_template_string(
            &body,
            r#"<p class="body-text">Real time alerts are available to members who support the search index with a donation. Your account no longer qualifies, so your alert <span class="identifier">{{alert.name}}</span> was changed from {{from}} to {{to}}.</p>
<p class="body-text">The alert will keep running {{to}}, and you won't miss any results. Once your account qualifies again, you can <a href="{{> alert_url}}">switch it back to real time</a>.</p>
{{> footer}}"#,
        )
        .context("registering cadence_demoted-body template")?;

    Ok(())
}
