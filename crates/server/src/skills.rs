//! Skill loading and prompt expansion (GLOSSARY "Skill"). A skill is a
//! named prompt template loaded from a directory containing `SKILL.md`
//! with front-matter `{name, description}` and a Markdown body. YAML
//! front-matter parsing itself is an external collaborator per spec §1;
//! this module only needs the two string fields, so it hand-parses the
//! narrow `key: value` front-matter block rather than pulling in a YAML
//! crate for two scalars.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub body: String,
    pub enabled: bool,
}

pub struct SkillRegistry {
    skills: BTreeMap<String, Skill>,
}

impl SkillRegistry {
    /// Load every `SKILL.md` found directly under one level of
    /// subdirectories of `skills_dir`. Missing or malformed skills are
    /// skipped rather than failing the whole load.
    pub fn load(skills_dir: &Path) -> Self {
        let mut skills = BTreeMap::new();
        if let Ok(entries) = std::fs::read_dir(skills_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let skill_file = path.join("SKILL.md");
                if let Some(skill) = load_skill_file(&skill_file) {
                    skills.insert(skill.name.clone(), skill);
                }
            }
        }
        Self { skills }
    }

    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.skills.get(name)
    }

    pub fn list(&self) -> Vec<&Skill> {
        self.skills.values().collect()
    }

    /// Expand a skill invocation into a prompt, or `None` for an unknown
    /// or disabled skill.
    pub fn expand(&self, name: &str, args: Option<&str>) -> Option<String> {
        let skill = self.skills.get(name)?;
        if !skill.enabled {
            return None;
        }
        let mut prompt = format!("<skill name=\"{}\">\n{}\n</skill>", skill.name, skill.body);
        if let Some(args) = args {
            if !args.is_empty() {
                prompt.push_str(&format!("\nUser request: {args}"));
            }
        }
        Some(prompt)
    }
}

fn load_skill_file(path: &PathBuf) -> Option<Skill> {
    let content = std::fs::read_to_string(path).ok()?;
    let (front_matter, body) = split_front_matter(&content)?;
    let fields = parse_front_matter(front_matter);
    let name = fields.get("name")?.clone();
    let description = fields.get("description").cloned().unwrap_or_default();
    let enabled = fields
        .get("enabled")
        .map(|v| v != "false")
        .unwrap_or(true);
    Some(Skill {
        name,
        description,
        body: body.trim().to_string(),
        enabled,
    })
}

fn split_front_matter(content: &str) -> Option<(&str, &str)> {
    let content = content.strip_prefix("---\n")?;
    let end = content.find("\n---")?;
    let front_matter = &content[..end];
    let rest = &content[end + 4..];
    let body = rest.strip_prefix('\n').unwrap_or(rest);
    Some((front_matter, body))
}

fn parse_front_matter(front_matter: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    for line in front_matter.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            fields.insert(key.trim().to_string(), value.to_string());
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_skill(dir: &Path, slug: &str, content: &str) {
        let skill_dir = dir.join(slug);
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(skill_dir.join("SKILL.md"), content).unwrap();
    }

    #[test]
    fn loads_skill_with_front_matter() {
        let dir = tempdir().unwrap();
        write_skill(
            dir.path(),
            "review",
            "---\nname: review\ndescription: Reviews code\n---\nLook for bugs.",
        );
        let registry = SkillRegistry::load(dir.path());
        let skill = registry.get("review").unwrap();
        assert_eq!(skill.description, "Reviews code");
        assert_eq!(skill.body, "Look for bugs.");
        assert!(skill.enabled);
    }

    #[test]
    fn expand_wraps_body_and_appends_args() {
        let dir = tempdir().unwrap();
        write_skill(
            dir.path(),
            "review",
            "---\nname: review\ndescription: Reviews code\n---\nLook for bugs.",
        );
        let registry = SkillRegistry::load(dir.path());
        let expanded = registry.expand("review", Some("focus on auth.rs")).unwrap();
        assert!(expanded.starts_with("<skill name=\"review\">"));
        assert!(expanded.contains("Look for bugs."));
        assert!(expanded.ends_with("User request: focus on auth.rs"));
    }

    #[test]
    fn expand_without_args_has_no_user_request_line() {
        let dir = tempdir().unwrap();
        write_skill(dir.path(), "review", "---\nname: review\n---\nBody.");
        let registry = SkillRegistry::load(dir.path());
        let expanded = registry.expand("review", None).unwrap();
        assert!(!expanded.contains("User request"));
    }

    #[test]
    fn expand_unknown_skill_returns_none() {
        let registry = SkillRegistry::load(Path::new("/nonexistent"));
        assert!(registry.expand("missing", None).is_none());
    }

    #[test]
    fn expand_disabled_skill_returns_none() {
        let dir = tempdir().unwrap();
        write_skill(
            dir.path(),
            "draft",
            "---\nname: draft\nenabled: false\n---\nBody.",
        );
        let registry = SkillRegistry::load(dir.path());
        assert!(registry.expand("draft", None).is_none());
    }

    #[test]
    fn malformed_skill_without_name_is_skipped() {
        let dir = tempdir().unwrap();
        write_skill(dir.path(), "broken", "no front matter here");
        let registry = SkillRegistry::load(dir.path());
        assert!(registry.list().is_empty());
    }
}
