//! Prompt templates for template synthesis and refinement.

/// Prompt for generating a detection template from a CVE record.
const GENERATION_TEMPLATE: &str = r#"You are a security engineer writing Nuclei detection templates.

Generate a Nuclei template that detects {cve_id}.

CVE description:
{description}

Requirements:
- The template `id` must be exactly `{cve_id}`.
- Include an `info` section with `name`, `author`, `severity` and `description`.
- Use appropriate HTTP requests with precise matchers; prefer status plus
  body/word matchers over status alone.
- The template must be valid YAML.

Return only the YAML document, without markdown formatting or commentary."#;

/// Prompt for refining a template that failed validation.
const REFINEMENT_TEMPLATE: &str = r#"You are a security engineer fixing a Nuclei detection template.

The following template for {cve_id} failed validation:

{template}

Validation output:
{failure}

Produce a corrected template. Keep the `id` exactly `{cve_id}`, keep the
`info` section, and adjust the requests or matchers so the template
detects the vulnerability. Return only the corrected YAML document,
without markdown formatting or commentary."#;

/// Prompt for synthesizing a one-off template from a natural-language
/// description of what to look for on a target.
const AD_HOC_TEMPLATE: &str = r#"You are a security engineer writing Nuclei detection templates.

Write a Nuclei template that scans for: {description}

Requirements:
- Give the template a unique, descriptive `id`.
- Include an `info` section with `name`, `author`, `severity` and `description`.
- Use appropriate HTTP requests with precise matchers.
- The template must be valid YAML.

Return only the YAML document, without markdown formatting or commentary."#;

/// Render the generation prompt for a CVE.
pub fn generation_prompt(cve_id: &str, description: &str) -> String {
    GENERATION_TEMPLATE
        .replace("{cve_id}", cve_id)
        .replace("{description}", description)
}

/// Render the refinement prompt for a failed template.
pub fn refinement_prompt(cve_id: &str, template: &str, failure: &str) -> String {
    REFINEMENT_TEMPLATE
        .replace("{cve_id}", cve_id)
        .replace("{template}", template)
        .replace("{failure}", failure)
}

/// Render the ad-hoc prompt for a natural-language scan request.
pub fn ad_hoc_prompt(description: &str) -> String {
    AD_HOC_TEMPLATE.replace("{description}", description)
}
