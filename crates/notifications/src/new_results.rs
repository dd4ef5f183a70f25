use super::template_names;
use anyhow::Context;

pub const KIND: &str = "new_results";

pub fn register_templates(registry: &mut handlebars::Handlebars<'_>) -> anyhow::Result<()> {
    let (subject, body) = template_names(KIND);
    registry
        .register_template_string(
            &subject,
            r#"{{count}} new {{pluralize count "result"}} for your alert {{{alert.name}}}"#,
        )
        .context("registering new_results-subject template")?;

    registry
        .register_template_string(
            &body,
            r#"<p class="body-text">Your {{alert.cadence}} alert <span class="identifier">{{alert.name}}</span> matched {{count}} new {{pluralize count "document"}}.</p>
<ul>
{{#each documents}}
    <li>
        {{#if url}}<a href="{{url}}" target="_blank" rel="noopener">{{title}}</a>{{else}}{{title}}{{/if}} <span class="date">({{date}})</span>
        {{#if snippet}}<p class="snippet">{{snippet}}</p>{{/if}}
    </li>
{{/each}}
</ul>
{{#if more}}
<p class="body-text">And {{more}} more. <a href="{{> alert_url}}">View all results</a>.</p>
{{/if}}
{{> footer}}"#,
        )
        .context("registering new_results-body template")?;

    Ok(())
}

#[cfg(test)]
mod test {
    use crate::test::{documents, fixture};

    #[test]
    fn subject_counts_documents() {
        let (renderer, owner, alert) = fixture();

        let email = renderer
            .render_new_results(&owner, &alert, &documents(3))
            .unwrap();
        insta::assert_snapshot!(email.subject, @"3 new results for your alert Search & Seizure");

        let email = renderer
            .render_new_results(&owner, &alert, &documents(1))
            .unwrap();
        insta::assert_snapshot!(email.subject, @"1 new result for your alert Search & Seizure");
    }

    #[test]
    fn body_lists_a_bounded_number_of_documents() {
        let (renderer, owner, alert) = fixture();

        let email = renderer
            .render_new_results(&owner, &alert, &documents(25))
            .unwrap();

        assert!(email.body.contains("State v. Party 0"));
        assert!(email.body.contains("State v. Party 19"));
        assert!(!email.body.contains("State v. Party 20"));
        assert!(email.body.contains("And 5 more."));
        assert!(email
            .body
            .contains("https://search.example.test/alerts/0000000000001234"));
        assert!(email.body.contains("(February 3, 2024)"));
        // Names and snippets are escaped within the HTML body.
        assert!(email.body.contains("Search &amp; Seizure"));
        assert!(email.body.contains("&lt;em&gt;fourth amendment&lt;/em&gt;"));

        let email = renderer
            .render_new_results(&owner, &alert, &documents(2))
            .unwrap();
        assert!(!email.body.contains("more."));
    }
}
