use crate::cmd::{open, parse_kv};
use crate::output::{print_fields, print_json, print_table};
use clap::Subcommand;
use govengine_core::metadata::{MetadataElement, MetadataReader, OpenMetadataStore, PropertyBag};
use std::path::Path;

#[derive(Subcommand)]
pub enum ElementSubcommand {
    /// Create a metadata element
    Create {
        /// Element type (e.g. Asset)
        type_name: String,
        /// Property as KEY=VALUE (repeatable)
        #[arg(long = "prop", value_parser = parse_kv)]
        props: Vec<(String, String)>,
    },
    /// Show one element with its classifications and relationships
    Show { guid: String },
    /// List the elements of one type
    List { type_name: String },
}

pub fn run(root: &Path, user: &str, subcmd: ElementSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ElementSubcommand::Create { type_name, props } => create(root, user, &type_name, props, json),
        ElementSubcommand::Show { guid } => show(root, user, &guid, json),
        ElementSubcommand::List { type_name } => list(root, user, &type_name, json),
    }
}

fn create(
    root: &Path,
    user: &str,
    type_name: &str,
    props: Vec<(String, String)>,
    json: bool,
) -> anyhow::Result<()> {
    let project = open(root)?;
    let properties: PropertyBag = props.into_iter().map(|(k, v)| (k, v.into())).collect();
    let guid = project.repo.create_element(user, type_name, properties)?;
    if json {
        print_json(&serde_json::json!({ "guid": guid }))?;
    } else {
        println!("{guid}");
    }
    Ok(())
}

fn show(root: &Path, user: &str, guid: &str, json: bool) -> anyhow::Result<()> {
    let project = open(root)?;
    let element = project.repo.get_element(user, guid)?;
    let relationships = project.repo.relationships(user, guid)?;

    if json {
        return print_json(&serde_json::json!({
            "element": element,
            "relationships": relationships,
        }));
    }

    print_fields(&[
        ("Element", element.guid.clone()),
        ("Type", element.type_name.clone()),
        ("Version", element.version.to_string()),
        ("Created by", element.created_by.clone()),
    ]);
    if !element.properties.is_empty() {
        println!("\nProperties:");
        for (k, v) in &element.properties {
            println!("  {k} = {}", serde_json::to_string(v)?);
        }
    }
    if !element.classifications.is_empty() {
        println!("\nClassifications:");
        for (name, props) in &element.classifications {
            if props.is_empty() {
                println!("  {name}");
            } else {
                println!("  {name} {}", serde_json::to_string(props)?);
            }
        }
    }
    if !relationships.is_empty() {
        println!("\nRelationships:");
        for r in &relationships {
            println!("  {} {} -> {} ({})", r.type_name, r.end1_guid, r.end2_guid, r.guid);
        }
    }
    Ok(())
}

fn list(root: &Path, user: &str, type_name: &str, json: bool) -> anyhow::Result<()> {
    let project = open(root)?;
    let elements = project.repo.find_elements(user, type_name)?;
    if json {
        return print_json(&elements);
    }
    if elements.is_empty() {
        println!("No {type_name} elements.");
        return Ok(());
    }
    let rows = elements.iter().map(row).collect();
    print_table(&["GUID", "NAME", "CLASSIFICATIONS", "UPDATED"], rows);
    Ok(())
}

fn row(element: &MetadataElement) -> Vec<String> {
    let classifications: Vec<&str> = element.classifications.keys().map(String::as_str).collect();
    vec![
        element.guid.clone(),
        element.qualified_name().unwrap_or("-").to_string(),
        classifications.join(","),
        element.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
    ]
}
