//! Per-file syntax checks.
//!
//! A module "holds a reference" to the log or the bus when it names a guarded
//! type, through a `use` item or a qualified path. Code under `#[cfg(test)]`
//! or in test functions is not audited.

use std::collections::HashSet;
use std::fmt;

use proc_macro2::{Span, TokenStream, TokenTree};
use serde::Serialize;
use syn::visit::{self, Visit};
use syn::{Attribute, Expr, ExprCall, ExprMethodCall, ExprStruct, Ident, ItemUse, Macro, Member, UseTree};

const WRITE_METHODS: &[&str] = &["append", "append_batch", "publish"];
const APPEND_METHODS: &[&str] = &["append", "append_batch"];
const CONCURRENT_MACROS: &[&str] = &["join", "try_join", "select"];
const CONCURRENT_FNS: &[&str] = &["join", "try_join", "select", "join_all", "try_join_all", "join3", "try_join3"];
const ROOT_CONSTRUCTORS: &[&str] = &["root", "root_with_clock"];
const EVENT_TYPE: &str = "DomainEvent";
const STORE_HANDLE: &str = "store";

/// What counts as a handle on the log or the bus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Guards {
    /// Type names, matched on the last path segment.
    pub types: HashSet<String>,
    /// Crates whose glob imports bring guarded types into scope.
    pub crates: HashSet<String>,
}

impl Guards {
    pub fn new<T, C>(types: T, crates: C) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
            crates: crates.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rule {
    PresentationImport,
    UnauthorizedWriter,
    ConcurrentAppendPublish,
    MissingPropagation,
}

impl Rule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rule::PresentationImport => "presentation-import",
            Rule::UnauthorizedWriter => "unauthorized-writer",
            Rule::ConcurrentAppendPublish => "concurrent-append-publish",
            Rule::MissingPropagation => "missing-propagation",
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Violation {
    pub file: String,
    pub line: usize,
    pub column: usize,
    pub rule: Rule,
    pub message: String,
}

/// How the file is classified by the configured globs.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct FileRole {
    pub presentation: bool,
    pub allowed_writer: bool,
    pub handler: bool,
}

#[derive(Debug, Clone, Copy)]
struct Location {
    line: usize,
    column: usize,
}

impl From<Span> for Location {
    fn from(span: Span) -> Self {
        let start = span.start();
        Self {
            line: start.line,
            column: start.column + 1,
        }
    }
}

/// Everything the rules need from one file, collected in a single pass.
struct Findings<'g> {
    guards: &'g Guards,
    guarded_refs: Vec<(String, Location)>,
    writes: Vec<(String, Location)>,
    /// Appends on a receiver named `store`, whatever its declared type.
    store_appends: Vec<(String, Location)>,
    concurrent: Vec<(String, Location)>,
    root_builds: Vec<(String, Location)>,
    unlinked_literals: Vec<(String, Location)>,
}

impl<'g> Findings<'g> {
    fn new(guards: &'g Guards) -> Self {
        Self {
            guards,
            guarded_refs: Vec::new(),
            writes: Vec::new(),
            store_appends: Vec::new(),
            concurrent: Vec::new(),
            root_builds: Vec::new(),
            unlinked_literals: Vec::new(),
        }
    }

    /// `root` is the first segment of the `use` path, if any.
    fn collect_use(&mut self, tree: &UseTree, root: Option<&Ident>) {
        match tree {
            UseTree::Path(path) => self.collect_use(&path.tree, root.or(Some(&path.ident))),
            UseTree::Name(name) => self.note_guarded(&name.ident),
            UseTree::Rename(rename) => self.note_guarded(&rename.ident),
            UseTree::Group(group) => {
                for item in &group.items {
                    self.collect_use(item, root);
                }
            }
            UseTree::Glob(glob) => {
                if let Some(root) = root.filter(|r| self.guards.crates.contains(&r.to_string())) {
                    self.guarded_refs.push((format!("{root}::*"), glob.star_token.spans[0].into()));
                }
            }
        }
    }

    fn note_guarded(&mut self, ident: &Ident) {
        let name = ident.to_string();
        if self.guards.types.contains(&name) {
            self.guarded_refs.push((name, ident.span().into()));
        }
    }
}

fn is_test_only(attrs: &[Attribute]) -> bool {
    attrs.iter().any(|attr| {
        let path = attr.path();
        if path.segments.last().is_some_and(|s| s.ident == "test") {
            return true;
        }
        if !path.is_ident("cfg") {
            return false;
        }
        match &attr.meta {
            syn::Meta::List(list) => {
                let idents = token_idents(&list.tokens);
                idents.iter().any(|i| i == "test") && !idents.iter().any(|i| i == "not")
            }
            _ => false,
        }
    })
}

fn token_idents(tokens: &TokenStream) -> Vec<String> {
    let mut out = Vec::new();
    for tree in tokens.clone() {
        match tree {
            TokenTree::Ident(ident) => out.push(ident.to_string()),
            TokenTree::Group(group) => out.extend(token_idents(&group.stream())),
            _ => {}
        }
    }
    out
}

fn last_segment(path: &syn::Path) -> Option<String> {
    path.segments.last().map(|s| s.ident.to_string())
}

/// Method names called anywhere inside an expression, including inside
/// macro invocations such as `vec![...]`.
#[derive(Default)]
struct CallNames(Vec<String>);

impl<'ast> Visit<'ast> for CallNames {
    fn visit_expr_method_call(&mut self, node: &'ast ExprMethodCall) {
        self.0.push(node.method.to_string());
        visit::visit_expr_method_call(self, node);
    }

    fn visit_macro(&mut self, node: &'ast Macro) {
        self.0.extend(token_idents(&node.tokens));
    }
}

impl CallNames {
    fn mixes_append_and_publish(&self) -> bool {
        self.0.iter().any(|n| APPEND_METHODS.contains(&n.as_str())) && self.0.iter().any(|n| n == "publish")
    }
}

fn ends_with_member(expr: &Expr, name: &str) -> bool {
    match expr {
        Expr::Field(field) => matches!(&field.member, Member::Named(ident) if ident == name),
        Expr::MethodCall(call) => call.method == name,
        Expr::Paren(inner) => ends_with_member(&inner.expr, name),
        Expr::Reference(inner) => ends_with_member(&inner.expr, name),
        _ => false,
    }
}

fn is_some_of_member(expr: &Expr, name: &str) -> bool {
    match expr {
        Expr::Call(call) => {
            matches!(&*call.func, Expr::Path(p) if p.path.is_ident("Some"))
                && call.args.len() == 1
                && call.args.first().is_some_and(|arg| ends_with_member(arg, name))
        }
        _ => false,
    }
}

fn field<'a>(node: &'a ExprStruct, name: &str) -> Option<&'a Expr> {
    node.fields
        .iter()
        .find(|f| matches!(&f.member, Member::Named(ident) if ident == name))
        .map(|f| &f.expr)
}

impl<'ast> Visit<'ast> for Findings<'_> {
    fn visit_item_use(&mut self, node: &'ast ItemUse) {
        if !is_test_only(&node.attrs) {
            self.collect_use(&node.tree, None);
        }
    }

    fn visit_item_mod(&mut self, node: &'ast syn::ItemMod) {
        if !is_test_only(&node.attrs) {
            visit::visit_item_mod(self, node);
        }
    }

    fn visit_item_fn(&mut self, node: &'ast syn::ItemFn) {
        if !is_test_only(&node.attrs) {
            visit::visit_item_fn(self, node);
        }
    }

    fn visit_item_impl(&mut self, node: &'ast syn::ItemImpl) {
        if !is_test_only(&node.attrs) {
            visit::visit_item_impl(self, node);
        }
    }

    fn visit_path(&mut self, node: &'ast syn::Path) {
        if node.segments.len() >= 2 {
            if let Some(last) = node.segments.last() {
                self.note_guarded(&last.ident);
            }
        }
        visit::visit_path(self, node);
    }

    fn visit_expr_method_call(&mut self, node: &'ast ExprMethodCall) {
        let name = node.method.to_string();
        if WRITE_METHODS.contains(&name.as_str()) {
            self.writes.push((name.clone(), node.method.span().into()));
        }
        if APPEND_METHODS.contains(&name.as_str()) && ends_with_member(&node.receiver, STORE_HANDLE) {
            self.store_appends.push((name.clone(), node.method.span().into()));
        }
        if name == "into_root" {
            self.root_builds.push((name, node.method.span().into()));
        }
        visit::visit_expr_method_call(self, node);
    }

    fn visit_expr_call(&mut self, node: &'ast ExprCall) {
        if let Expr::Path(func) = &*node.func {
            let segments: Vec<String> = func.path.segments.iter().map(|s| s.ident.to_string()).collect();
            let span: Location = func
                .path
                .segments
                .last()
                .map(|s| s.ident.span())
                .unwrap_or_else(Span::call_site)
                .into();

            if let Some(last) = segments.last() {
                if CONCURRENT_FNS.contains(&last.as_str()) {
                    let mut names = CallNames::default();
                    for arg in &node.args {
                        names.visit_expr(arg);
                    }
                    if names.mixes_append_and_publish() {
                        self.concurrent.push((format!("{last}(..)"), span));
                    }
                }

                let is_root_ctor = ROOT_CONSTRUCTORS.contains(&last.as_str())
                    && segments.len() >= 2
                    && segments[segments.len() - 2] == EVENT_TYPE;
                if is_root_ctor {
                    self.root_builds.push((format!("{EVENT_TYPE}::{last}"), span));
                }
            }
        }
        visit::visit_expr_call(self, node);
    }

    fn visit_expr_struct(&mut self, node: &'ast ExprStruct) {
        if last_segment(&node.path).as_deref() == Some(EVENT_TYPE) {
            let correlated = field(node, "correlation_id").is_some_and(|e| ends_with_member(e, "correlation_id"));
            let caused = field(node, "causation_id").is_some_and(|e| is_some_of_member(e, "event_id"));
            if !(correlated && caused) {
                let span = node
                    .path
                    .segments
                    .last()
                    .map(|s| s.ident.span())
                    .unwrap_or_else(Span::call_site);
                self.unlinked_literals.push((EVENT_TYPE.to_string(), span.into()));
            }
        }
        visit::visit_expr_struct(self, node);
    }

    fn visit_macro(&mut self, node: &'ast Macro) {
        if let Some(name) = last_segment(&node.path) {
            if CONCURRENT_MACROS.contains(&name.as_str()) {
                let idents = token_idents(&node.tokens);
                let names = CallNames(idents);
                if names.mixes_append_and_publish() {
                    let span = node
                        .path
                        .segments
                        .last()
                        .map(|s| s.ident.span())
                        .unwrap_or_else(Span::call_site);
                    self.concurrent.push((format!("{name}!"), span.into()));
                }
            }
        }
        visit::visit_macro(self, node);
    }
}

/// Run every rule over one parsed file.
pub fn check_file(
    file: &str,
    syntax: &syn::File,
    role: FileRole,
    guards: &Guards,
) -> Vec<Violation> {
    let mut findings = Findings::new(guards);
    findings.visit_file(syntax);

    let mut violations = Vec::new();
    let mut push = |rule: Rule, at: Location, message: String| {
        violations.push(Violation {
            file: file.to_string(),
            line: at.line,
            column: at.column,
            rule,
            message,
        });
    };

    if role.presentation {
        for (name, at) in &findings.guarded_refs {
            push(
                Rule::PresentationImport,
                *at,
                format!("presentation module references `{name}`; subscribe through the runtime instead"),
            );
        }
    }

    if !role.allowed_writer && !role.handler {
        let holds_reference = !findings.guarded_refs.is_empty();
        let unauthorized = if holds_reference {
            &findings.writes
        } else {
            &findings.store_appends
        };
        for (method, at) in unauthorized {
            push(
                Rule::UnauthorizedWriter,
                *at,
                format!("`{method}` called outside the publish use case and event handlers"),
            );
        }
    }

    for (combinator, at) in &findings.concurrent {
        push(
            Rule::ConcurrentAppendPublish,
            *at,
            format!("`{combinator}` runs append and publish concurrently; await the append first"),
        );
    }

    if role.handler {
        for (ctor, at) in &findings.root_builds {
            push(
                Rule::MissingPropagation,
                *at,
                format!("handler builds a root event with `{ctor}`; derive it from the handled event"),
            );
        }
        for (_, at) in &findings.unlinked_literals {
            push(
                Rule::MissingPropagation,
                *at,
                "event literal without `correlation_id: <parent>.correlation_id` and \
                 `causation_id: Some(<parent>.event_id)`"
                    .to_string(),
            );
        }
    }

    violations.sort();
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guarded() -> Guards {
        Guards::new(["EventStore", "WorkspaceEventBus"], ["qcflow_infra", "qcflow_events"])
    }

    fn check(source: &str, role: FileRole) -> Vec<Violation> {
        let syntax = syn::parse_file(source).unwrap();
        check_file("src/module.rs", &syntax, role, &guarded())
    }

    fn rules(violations: &[Violation]) -> Vec<Rule> {
        violations.iter().map(|v| v.rule).collect()
    }

    #[test]
    fn presentation_import_is_reported_with_its_line() {
        let source = "use std::sync::Arc;\nuse qcflow_infra::{EventStore, WorkspaceRuntime};\n";
        let violations = check(
            source,
            FileRole {
                presentation: true,
                ..FileRole::default()
            },
        );
        assert_eq!(rules(&violations), vec![Rule::PresentationImport]);
        assert_eq!(violations[0].line, 2);
    }

    #[test]
    fn qualified_paths_count_as_references() {
        let source = r#"
            fn wire(store: std::sync::Arc<dyn qcflow_infra::EventStore>, e: Event) {
                store.append(e);
            }
        "#;
        let violations = check(source, FileRole::default());
        assert_eq!(rules(&violations), vec![Rule::UnauthorizedWriter]);
    }

    #[test]
    fn writes_are_fine_in_allowlisted_or_reference_free_modules() {
        let source = r#"
            use qcflow_infra::EventStore;
            async fn go(store: &dyn EventStore, e: Event) { store.append(e).await; }
        "#;
        let allowed = FileRole {
            allowed_writer: true,
            ..FileRole::default()
        };
        assert!(check(source, allowed).is_empty());

        // A `publish` on something unrelated to the log is not a write.
        let unrelated = "fn go(feed: &Feed) { feed.publish(); }";
        assert!(check(unrelated, FileRole::default()).is_empty());
    }

    #[test]
    fn glob_import_of_a_guarded_crate_is_a_reference() {
        let source = r#"
            use qcflow_infra::*;
            async fn go(s: &Store, e: Event) { s.append(e).await; }
        "#;
        let violations = check(source, FileRole::default());
        assert_eq!(rules(&violations), vec![Rule::UnauthorizedWriter]);

        let nested = "use qcflow_events::bus::*;";
        let presentation = FileRole {
            presentation: true,
            ..FileRole::default()
        };
        assert_eq!(rules(&check(nested, presentation)), vec![Rule::PresentationImport]);

        let unrelated = "use std::collections::*;
fn go(s: &Store, e: Event) { s.append(e); }";
        assert!(check(unrelated, FileRole::default()).is_empty());
    }

    #[test]
    fn appends_on_a_store_handle_need_no_import() {
        let source = r#"
            async fn go(f: &Factory, e: Event) {
                f.store().append(e.clone()).await;
                self.store.append_batch(vec![e]).await;
            }
        "#;
        let violations = check(source, FileRole::default());
        assert_eq!(
            rules(&violations),
            vec![Rule::UnauthorizedWriter, Rule::UnauthorizedWriter]
        );
        assert_eq!(violations[0].line, 3);

        let handler = FileRole {
            handler: true,
            ..FileRole::default()
        };
        assert!(check(source, handler).is_empty());
    }

    #[test]
    fn join_of_append_and_publish_is_flagged() {
        let macro_form = r#"
            async fn go() {
                let _ = tokio::join!(store.append(e.clone()), bus.publish(e));
            }
        "#;
        let call_form = r#"
            async fn go() {
                futures::future::join(store.append(e.clone()), bus.publish(e)).await;
            }
        "#;
        let sequential = r#"
            async fn go() {
                store.append(e.clone()).await?;
                bus.publish(e).await?;
                let _ = tokio::join!(load_a(), load_b());
            }
        "#;
        let allowed = FileRole {
            allowed_writer: true,
            ..FileRole::default()
        };
        assert_eq!(rules(&check(macro_form, allowed)), vec![Rule::ConcurrentAppendPublish]);
        assert_eq!(rules(&check(call_form, allowed)), vec![Rule::ConcurrentAppendPublish]);
        assert!(check(sequential, allowed).is_empty());
    }

    #[test]
    fn handler_building_root_events_is_missing_propagation() {
        let source = r#"
            async fn on_qc_failed(publisher: PublishEvent, event: DomainEvent) {
                let issue = DomainEvent::root(ws, agg, "IssueCreated", json!({}));
                let typed = TaskEvent::IssueCreated(x).into_root(ws, agg);
                let ok = DomainEvent::caused_by(&event, agg, "IssueCreated", json!({}));
            }
        "#;
        let handler = FileRole {
            handler: true,
            ..FileRole::default()
        };
        let violations = check(source, handler);
        assert_eq!(rules(&violations), vec![Rule::MissingPropagation, Rule::MissingPropagation]);
        assert_eq!(violations[0].line, 3);
    }

    #[test]
    fn struct_literals_must_link_to_the_parent() {
        let linked = r#"
            fn f(parent: &DomainEvent) -> DomainEvent {
                DomainEvent {
                    correlation_id: parent.correlation_id,
                    causation_id: Some(parent.event_id),
                    ..template()
                }
            }
        "#;
        let unlinked = r#"
            fn f(parent: &DomainEvent) -> DomainEvent {
                DomainEvent { correlation_id: new_id(), causation_id: None, ..template() }
            }
        "#;
        let handler = FileRole {
            handler: true,
            ..FileRole::default()
        };
        assert!(check(linked, handler).is_empty());
        assert_eq!(rules(&check(unlinked, handler)), vec![Rule::MissingPropagation]);
    }

    #[test]
    fn test_code_is_not_audited() {
        let source = r#"
            #[cfg(test)]
            mod tests {
                use qcflow_infra::EventStore;
                #[tokio::test]
                async fn direct() { store.append(e).await; }
            }
        "#;
        assert!(check(source, FileRole { presentation: true, ..FileRole::default() }).is_empty());
    }
}
