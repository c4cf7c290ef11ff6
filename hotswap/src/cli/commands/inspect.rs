//! Inspect command: print the structure of a class file

use crate::cli::app::InspectArgs;
use anyhow::{Context, Result};
use hotswap_core::classfile::read_class_file;
use hotswap_core::{ClassFile, RetryPolicy};
use std::fmt::Write;

/// Execute the inspect command
pub fn execute(args: InspectArgs) -> Result<()> {
    let class = read_class_file(&args.class_file, &RetryPolicy::default())
        .with_context(|| format!("Unable to inspect {}", args.class_file.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&class)?);
    } else {
        print!("{}", describe(&class));
    }
    Ok(())
}

fn describe(class: &ClassFile) -> String {
    let mut out = String::new();
    let kind = if class.is_interface() { "interface" } else { "class" };

    let _ = writeln!(out, "{} {}", kind, class.name);
    let _ = writeln!(out, "  version: {}.{}", class.major_version, class.minor_version);
    let _ = writeln!(out, "  bytes: {}", class.bytes().len());
    if let Some(super_name) = &class.super_name {
        let _ = writeln!(out, "  extends: {}", super_name);
    }
    if !class.interfaces.is_empty() {
        let _ = writeln!(out, "  implements: {}", class.interfaces.join(", "));
    }

    let _ = writeln!(out, "  fields: {}", class.fields.len());
    for field in &class.fields {
        let _ = writeln!(out, "    {} {}", field.name, field.descriptor);
    }
    let _ = writeln!(out, "  methods: {}", class.methods.len());
    for method in &class.methods {
        let _ = writeln!(out, "    {}{}", method.name, method.descriptor);
    }
    out
}
