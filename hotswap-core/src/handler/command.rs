//! Command scheduled for a handler after a matching file change

use super::{HandlerId, HandlerRegistration, Invocation, InvokeError, WatchKind};
use crate::classfile::{ClassFile, read_class_file};
use crate::command::{Command, CommandKey, MergeableCommand, MergedCommands};
use crate::config::RetryPolicy;
use crate::loader::LoaderId;
use crate::monitor::{FileEvent, WatchFileEvent};
use crate::panic_message;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Identity of a watch event command: same handler, same loader, same file.
/// The event kind is left out so that a burst of events on one file merges.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WatchEventKey {
    handler: HandlerId,
    loader: LoaderId,
    path: PathBuf,
}

/// Runs one handler for one file change
pub struct WatchEventCommand {
    registration: Arc<HandlerRegistration>,
    event: WatchFileEvent,
    /// Classpath directory the file was found under
    base: Option<PathBuf>,
    retry: RetryPolicy,
    merged: MergedCommands,
}

impl WatchEventCommand {
    pub fn new(
        registration: Arc<HandlerRegistration>,
        event: WatchFileEvent,
        base: Option<PathBuf>,
        retry: RetryPolicy,
    ) -> Self {
        Self { registration, event, base, retry, merged: MergedCommands::new() }
    }

    /// The event the handler will see, after merging
    pub fn event(&self) -> &WatchFileEvent {
        &self.event
    }

    /// Class name derived from the file's location under its classpath root
    fn derived_class_name(&self) -> Option<String> {
        let base = self.base.as_ref()?;
        let relative = self.event.path.strip_prefix(base).ok()?;
        regex_utils::class_file::binary_name(relative.to_str()?)
    }

    fn target(&self) -> String {
        format!("{} {}", self.event.kind, self.event.uri)
    }
}

/// Combine two events for the same file, oldest first.
///
/// A delete followed by a create is a replacement; a create followed by
/// modifications is still a creation.
pub(crate) fn merge_events(older: &WatchFileEvent, newer: &WatchFileEvent) -> WatchFileEvent {
    let kind = match (older.kind, newer.kind) {
        (FileEvent::Delete, FileEvent::Create) => FileEvent::Modify,
        (FileEvent::Create, FileEvent::Modify) => FileEvent::Create,
        (_, newer_kind) => newer_kind,
    };
    WatchFileEvent { kind, ..newer.clone() }
}

impl Command for WatchEventCommand {
    fn key(&self) -> CommandKey {
        CommandKey::new(WatchEventKey {
            handler: self.registration.id,
            loader: self.registration.loader,
            path: self.event.path.clone(),
        })
    }

    fn execute(&self) -> anyhow::Result<()> {
        let registration = &self.registration;
        let filter = &registration.filter;
        let event = &self.event;

        if !registration.is_active() {
            trace!("Handler {} of {} is closed, skipping {}", registration.name, registration.loader, event);
            return Ok(());
        }

        trace!("Watch event {} for handler {}", event, registration.name);

        if filter.only_regular_files && !event.is_file {
            trace!("Skipping {}: not a regular file", event.uri);
            return Ok(());
        }
        if !filter.events.contains(&event.kind) {
            trace!("Skipping {}: {} not requested", event.uri, event.kind);
            return Ok(());
        }
        if !filter.accepts_uri(&event.uri) {
            trace!("Skipping {}: does not match filter", event.uri);
            return Ok(());
        }

        let mut class_file: Option<ClassFile> = None;
        let mut class_name: Option<String> = None;

        if filter.kind == WatchKind::ClassFile {
            if event.kind != FileEvent::Delete {
                match read_class_file(&event.path, &self.retry) {
                    Ok(class) => {
                        class_name = Some(class.name.clone());
                        class_file = Some(class);
                    }
                    Err(e) => {
                        warn!("Unable to read class file {}: {}", event.uri, e);
                        return Ok(());
                    }
                }
            } else {
                class_name = self.derived_class_name();
            }

            let Some(name) = class_name.as_deref() else {
                trace!("Skipping {}: no class name", event.uri);
                return Ok(());
            };
            if !filter.accepts_class_name(name) {
                trace!("Skipping {}: class {} does not match", event.uri, name);
                return Ok(());
            }
        }

        let handler = registration.handler();
        if handler.requires_class() && class_file.is_none() {
            debug!("Handler {} needs a class, none available for {}", registration.name, self.target());
            return Ok(());
        }

        let invocation = Invocation {
            loader: registration.loader,
            event,
            class_file: class_file.as_ref(),
            class_name: class_name.as_deref(),
        };

        debug!(
            "Executing handler {} of plugin {} for {}",
            registration.name,
            registration.plugin,
            self.target()
        );
        match catch_unwind(AssertUnwindSafe(|| handler.call(&invocation))) {
            Ok(Ok(())) => {}
            Ok(Err(InvokeError::Unresolved(parameter))) => error!(
                "Unable to call handler {} of plugin {}: parameter type {} is not recognized",
                registration.name, registration.plugin, parameter
            ),
            Ok(Err(InvokeError::Failed(e))) => error!(
                "Handler {} of plugin {} failed for {}: {:#}",
                registration.name,
                registration.plugin,
                self.target(),
                e
            ),
            Err(panic) => error!(
                "Handler {} of plugin {} panicked for {}: {}",
                registration.name,
                registration.plugin,
                self.target(),
                panic_message(panic.as_ref())
            ),
        }

        Ok(())
    }

    fn merge(mut self: Box<Self>, newer: Box<dyn Command>) -> Box<dyn Command> {
        if let Some(next) = (*newer).downcast_ref::<WatchEventCommand>() {
            self.event = merge_events(&self.event, &next.event);
        }
        self.absorb(newer)
    }

    fn merged(&self) -> &[Box<dyn Command>] {
        self.merged.as_slice()
    }
}

impl MergeableCommand for WatchEventCommand {
    fn merged_commands(&self) -> &MergedCommands {
        &self.merged
    }

    fn merged_commands_mut(&mut self) -> &mut MergedCommands {
        &mut self.merged
    }
}

impl fmt::Debug for WatchEventCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchEventCommand")
            .field("handler", &self.registration.name)
            .field("plugin", &self.registration.plugin)
            .field("loader", &self.registration.loader)
            .field("event", &self.event)
            .field("merged", &self.merged.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::sample_class;
    use crate::handler::{ClassName, IntoWatchHandler, WatchFilter};
    use std::sync::Mutex;
    use tempfile::TempDir;

    type Calls = Arc<Mutex<Vec<String>>>;

    fn registration(
        filter: WatchFilter,
        handler: Box<dyn crate::handler::WatchHandler>,
    ) -> Arc<HandlerRegistration> {
        Arc::new(HandlerRegistration::new(
            LoaderId::next(),
            "TestPlugin",
            "on_change",
            filter.compile().unwrap(),
            handler,
        ))
    }

    fn command(
        registration: &Arc<HandlerRegistration>,
        path: &std::path::Path,
        kind: FileEvent,
        base: &std::path::Path,
    ) -> WatchEventCommand {
        let event = WatchFileEvent::with_type(path, kind, true, false).unwrap();
        WatchEventCommand::new(
            registration.clone(),
            event,
            Some(base.to_path_buf()),
            RetryPolicy::default(),
        )
    }

    fn recorder(calls: &Calls) -> Box<dyn crate::handler::WatchHandler> {
        let calls = calls.clone();
        (move |kind: FileEvent, name: ClassName| {
            calls.lock().unwrap().push(format!("{} {}", kind, name));
        })
        .into_handler()
    }

    #[test]
    fn test_merge_policy() {
        let at = |kind| WatchFileEvent::with_type("/a/Foo.class", kind, true, false).unwrap();

        assert_eq!(merge_events(&at(FileEvent::Delete), &at(FileEvent::Create)).kind, FileEvent::Modify);
        assert_eq!(merge_events(&at(FileEvent::Create), &at(FileEvent::Modify)).kind, FileEvent::Create);
        assert_eq!(merge_events(&at(FileEvent::Modify), &at(FileEvent::Delete)).kind, FileEvent::Delete);
        assert_eq!(merge_events(&at(FileEvent::Modify), &at(FileEvent::Modify)).kind, FileEvent::Modify);
    }

    #[test]
    fn test_create_then_modify_runs_handler_once_as_create() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("com").join("example");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("Foo.class");
        std::fs::write(&file, sample_class("com/example/Foo")).unwrap();

        let calls = Calls::default();
        let registration = registration(WatchFilter::class_files(), recorder(&calls));

        let created = Box::new(command(&registration, &file, FileEvent::Create, temp_dir.path()));
        let modified = Box::new(command(&registration, &file, FileEvent::Modify, temp_dir.path()));
        assert_eq!(created.key(), modified.key());

        let merged = created.merge(modified);
        assert_eq!(merged.merged().len(), 1);
        merged.execute().unwrap();

        assert_eq!(*calls.lock().unwrap(), vec!["CREATE com.example.Foo"]);
    }

    #[test]
    fn test_deleted_class_name_comes_from_path() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("com").join("example").join("Gone.class");

        let calls = Calls::default();
        let registration = registration(WatchFilter::class_files(), recorder(&calls));
        command(&registration, &file, FileEvent::Delete, temp_dir.path()).execute().unwrap();

        assert_eq!(*calls.lock().unwrap(), vec!["DELETE com.example.Gone"]);
    }

    #[test]
    fn test_class_handler_skips_delete_and_mismatched_names() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("Foo.class");
        std::fs::write(&file, sample_class("Foo")).unwrap();

        let calls = Calls::default();
        let sink = calls.clone();
        let needs_class = (move |class: ClassFile| {
            sink.lock().unwrap().push(class.name);
        })
        .into_handler();
        let registration = registration(WatchFilter::class_files(), needs_class);

        command(&registration, &file, FileEvent::Delete, temp_dir.path()).execute().unwrap();
        assert!(calls.lock().unwrap().is_empty());

        let other_calls = Calls::default();
        let filtered = registration_with_name("org\\..*", recorder(&other_calls));
        command(&filtered, &file, FileEvent::Modify, temp_dir.path()).execute().unwrap();
        assert!(other_calls.lock().unwrap().is_empty());

        command(&registration, &file, FileEvent::Modify, temp_dir.path()).execute().unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["Foo"]);
    }

    fn registration_with_name(
        pattern: &str,
        handler: Box<dyn crate::handler::WatchHandler>,
    ) -> Arc<HandlerRegistration> {
        registration(WatchFilter::class_files().class_name(pattern), handler)
    }

    #[test]
    fn test_unresolved_parameter_and_failures_are_swallowed() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("app.properties");
        std::fs::write(&file, "a=1").unwrap();

        // A resource event has no class name to give
        let calls = Calls::default();
        let registration = registration(WatchFilter::resource(""), recorder(&calls));
        command(&registration, &file, FileEvent::Modify, temp_dir.path()).execute().unwrap();
        assert!(calls.lock().unwrap().is_empty());

        let failing = (|| -> anyhow::Result<()> { anyhow::bail!("handler failure") }).into_handler();
        let failing = registration_for_resource(failing);
        command(&failing, &file, FileEvent::Modify, temp_dir.path()).execute().unwrap();

        let panicking = (|| -> anyhow::Result<()> { panic!("handler panic") }).into_handler();
        let panicking = registration_for_resource(panicking);
        command(&panicking, &file, FileEvent::Modify, temp_dir.path()).execute().unwrap();
    }

    fn registration_for_resource(handler: Box<dyn crate::handler::WatchHandler>) -> Arc<HandlerRegistration> {
        registration(WatchFilter::resource(""), handler)
    }

    #[test]
    fn test_deactivated_registration_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("app.properties");
        std::fs::write(&file, "a=1").unwrap();

        let calls = Calls::default();
        let sink = calls.clone();
        let handler = (move |path: PathBuf| {
            sink.lock().unwrap().push(path.display().to_string());
        })
        .into_handler();
        let registration = registration(WatchFilter::resource(""), handler);
        let pending = command(&registration, &file, FileEvent::Modify, temp_dir.path());

        registration.deactivate();
        pending.execute().unwrap();
        assert!(calls.lock().unwrap().is_empty());
    }
}
