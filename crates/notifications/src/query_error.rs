use super::template_names;
use anyhow::Context;

pub const KIND: &str = "query_error";

pub fn register_templates(registry: &mut handlebars::Handlebars<'_>) -> anyhow::Result<()> {
    let (subject, body) = template_names(KIND);
    registry
        .register_template_string(
            &subject,
            r#"Your alert {{{alert.name}}} has stopped running"#,
        )
        .context("registering query_error-subject template")?;

    registry
        .register_template_string(
            &body,
            r#"<p class="body-text">The search index could not run the query of your alert <span class="identifier">{{alert.name}}</span>:</p>
<pre class="query">{{alert.query}}</pre>
<p class="body-text">The index reported: {{message}}</p>
<p class="body-text">The alert won't run again until its query is fixed. <a href="{{> alert_url}}">Edit the alert</a> to correct it.</p>
{{> footer}}"#,
        )
        .context("registering query_error-body template")?;

    Ok(())
}
