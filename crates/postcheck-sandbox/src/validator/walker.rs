//! Shared syntax-tree traversal for both validator modes.
//!
//! The walker does not judge anything. It records every node that a policy
//! might care about, in visit order, and collects the set of locally declared
//! names. Policies in [`super::policy`] turn the findings into diagnostics.

use std::collections::HashSet;

use oxc_ast::ast::*;
use oxc_span::Span;

/// A syntactic fact a policy may turn into a diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Finding {
    /// A bare identifier reference (`window`, `fetch`, `pm`).
    Reference { name: String, span: Span },
    /// A call whose callee is a bare identifier (`eval(...)`).
    Call { callee: String, span: Span },
    /// Member access on a bare identifier. `property` is `None` when the
    /// member is computed from a non-literal expression.
    Member {
        object: String,
        property: Option<String>,
        span: Span,
    },
    /// `while (true)`.
    InfiniteLoop { span: Span },
    /// A construct rejected in every mode.
    Escape { message: &'static str, span: Span },
}

/// Walks a parsed program, recording findings and declarations.
#[derive(Default)]
pub(crate) struct AstWalker {
    pub(crate) findings: Vec<Finding>,
    pub(crate) declared: HashSet<String>,
}

impl AstWalker {
    pub(crate) fn walk_program(&mut self, program: &Program<'_>) {
        for stmt in &program.body {
            self.walk_statement(stmt);
        }
    }

    fn record(&mut self, finding: Finding) {
        self.findings.push(finding);
    }

    fn escape(&mut self, message: &'static str, span: Span) {
        self.record(Finding::Escape { message, span });
    }

    fn declare(&mut self, name: &str) {
        self.declared.insert(name.to_string());
    }

    // --- Declarations ---

    fn walk_binding_pattern(&mut self, pattern: &BindingPattern<'_>) {
        match &pattern.kind {
            BindingPatternKind::BindingIdentifier(id) => self.declare(id.name.as_str()),
            BindingPatternKind::ObjectPattern(obj) => {
                for prop in &obj.properties {
                    if prop.computed {
                        if let Some(key) = prop.key.as_expression() {
                            self.walk_expression(key);
                        }
                    } else if prop.key.static_name().is_some_and(|name| name == "constructor") {
                        self.escape("Access to 'constructor' is not allowed.", prop.span);
                    }
                    self.walk_binding_pattern(&prop.value);
                }
                if let Some(rest) = &obj.rest {
                    self.walk_binding_pattern(&rest.argument);
                }
            }
            BindingPatternKind::ArrayPattern(arr) => {
                for element in arr.elements.iter().flatten() {
                    self.walk_binding_pattern(element);
                }
                if let Some(rest) = &arr.rest {
                    self.walk_binding_pattern(&rest.argument);
                }
            }
            BindingPatternKind::AssignmentPattern(assign) => {
                self.walk_binding_pattern(&assign.left);
                self.walk_expression(&assign.right);
            }
        }
    }

    fn walk_variable_declaration(&mut self, decl: &VariableDeclaration<'_>) {
        for declarator in &decl.declarations {
            self.walk_binding_pattern(&declarator.id);
            if let Some(init) = &declarator.init {
                self.walk_expression(init);
            }
        }
    }

    fn walk_function(&mut self, func: &Function<'_>) {
        if let Some(id) = &func.id {
            self.declare(id.name.as_str());
        }
        self.walk_formal_parameters(&func.params);
        if let Some(body) = &func.body {
            self.walk_function_body(body);
        }
    }

    fn walk_formal_parameters(&mut self, params: &FormalParameters<'_>) {
        for param in &params.items {
            self.walk_binding_pattern(&param.pattern);
        }
        if let Some(rest) = &params.rest {
            self.walk_binding_pattern(&rest.argument);
        }
    }

    fn walk_function_body(&mut self, body: &FunctionBody<'_>) {
        for s in &body.statements {
            self.walk_statement(s);
        }
    }

    fn walk_class(&mut self, class: &Class<'_>) {
        if let Some(id) = &class.id {
            self.declare(id.name.as_str());
        }
        if let Some(super_class) = &class.super_class {
            self.walk_expression(super_class);
        }
        for element in &class.body.body {
            match element {
                ClassElement::MethodDefinition(md) => {
                    if md.computed {
                        if let Some(key) = md.key.as_expression() {
                            self.walk_expression(key);
                        }
                    }
                    self.walk_function(&md.value);
                }
                ClassElement::PropertyDefinition(pd) => {
                    if pd.computed {
                        if let Some(key) = pd.key.as_expression() {
                            self.walk_expression(key);
                        }
                    }
                    if let Some(val) = &pd.value {
                        self.walk_expression(val);
                    }
                }
                ClassElement::StaticBlock(sb) => {
                    for s in &sb.body {
                        self.walk_statement(s);
                    }
                }
                _ => {}
            }
        }
    }

    // --- Statements ---

    fn walk_statement(&mut self, stmt: &Statement<'_>) {
        match stmt {
            Statement::ExpressionStatement(es) => self.walk_expression(&es.expression),
            Statement::BlockStatement(block) => {
                for s in &block.body {
                    self.walk_statement(s);
                }
            }
            Statement::IfStatement(ifs) => {
                self.walk_expression(&ifs.test);
                self.walk_statement(&ifs.consequent);
                if let Some(alt) = &ifs.alternate {
                    self.walk_statement(alt);
                }
            }
            Statement::ReturnStatement(ret) => {
                if let Some(arg) = &ret.argument {
                    self.walk_expression(arg);
                }
            }
            Statement::VariableDeclaration(decl) => self.walk_variable_declaration(decl),
            Statement::ForStatement(fors) => {
                if let Some(init) = &fors.init {
                    match init {
                        ForStatementInit::VariableDeclaration(decl) => {
                            self.walk_variable_declaration(decl)
                        }
                        _ => {
                            if let Some(expr) = init.as_expression() {
                                self.walk_expression(expr);
                            }
                        }
                    }
                }
                if let Some(test) = &fors.test {
                    self.walk_expression(test);
                }
                if let Some(update) = &fors.update {
                    self.walk_expression(update);
                }
                self.walk_statement(&fors.body);
            }
            Statement::ForInStatement(fis) => {
                self.walk_for_left(&fis.left);
                self.walk_expression(&fis.right);
                self.walk_statement(&fis.body);
            }
            Statement::ForOfStatement(fos) => {
                self.walk_for_left(&fos.left);
                self.walk_expression(&fos.right);
                self.walk_statement(&fos.body);
            }
            Statement::WhileStatement(ws) => {
                if matches!(&ws.test, Expression::BooleanLiteral(lit) if lit.value) {
                    self.record(Finding::InfiniteLoop { span: ws.span });
                }
                self.walk_expression(&ws.test);
                self.walk_statement(&ws.body);
            }
            Statement::DoWhileStatement(dws) => {
                self.walk_statement(&dws.body);
                self.walk_expression(&dws.test);
            }
            Statement::WithStatement(ws) => {
                self.escape("The 'with' statement is not allowed.", ws.span);
                self.walk_expression(&ws.object);
                self.walk_statement(&ws.body);
            }
            Statement::SwitchStatement(ss) => {
                self.walk_expression(&ss.discriminant);
                for case in &ss.cases {
                    if let Some(test) = &case.test {
                        self.walk_expression(test);
                    }
                    for s in &case.consequent {
                        self.walk_statement(s);
                    }
                }
            }
            Statement::TryStatement(ts) => {
                for s in &ts.block.body {
                    self.walk_statement(s);
                }
                if let Some(handler) = &ts.handler {
                    if let Some(param) = &handler.param {
                        self.walk_binding_pattern(&param.pattern);
                    }
                    for s in &handler.body.body {
                        self.walk_statement(s);
                    }
                }
                if let Some(finalizer) = &ts.finalizer {
                    for s in &finalizer.body {
                        self.walk_statement(s);
                    }
                }
            }
            Statement::ThrowStatement(ts) => self.walk_expression(&ts.argument),
            Statement::LabeledStatement(ls) => self.walk_statement(&ls.body),
            Statement::FunctionDeclaration(fd) => self.walk_function(fd),
            Statement::ClassDeclaration(cd) => self.walk_class(cd),
            // Break, Continue, Empty, Debugger, module and TS declarations
            _ => {}
        }
    }

    fn walk_for_left(&mut self, left: &ForStatementLeft<'_>) {
        match left {
            ForStatementLeft::VariableDeclaration(decl) => self.walk_variable_declaration(decl),
            _ => {
                if let Some(target) = left.as_assignment_target() {
                    self.walk_assignment_target(target);
                }
            }
        }
    }

    // --- Assignment targets ---

    fn walk_assignment_target(&mut self, target: &AssignmentTarget<'_>) {
        match target {
            AssignmentTarget::AssignmentTargetIdentifier(ident) => {
                self.record(Finding::Reference {
                    name: ident.name.to_string(),
                    span: ident.span,
                });
            }
            AssignmentTarget::ArrayAssignmentTarget(arr) => {
                for element in arr.elements.iter().flatten() {
                    self.walk_assignment_target_maybe_default(element);
                }
                if let Some(rest) = &arr.rest {
                    self.walk_assignment_target(&rest.target);
                }
            }
            AssignmentTarget::ObjectAssignmentTarget(obj) => {
                for prop in &obj.properties {
                    match prop {
                        AssignmentTargetProperty::AssignmentTargetPropertyIdentifier(p) => {
                            self.record(Finding::Reference {
                                name: p.binding.name.to_string(),
                                span: p.binding.span,
                            });
                            if let Some(init) = &p.init {
                                self.walk_expression(init);
                            }
                        }
                        AssignmentTargetProperty::AssignmentTargetPropertyProperty(p) => {
                            if let Some(key) = p.name.as_expression() {
                                self.walk_expression(key);
                            }
                            self.walk_assignment_target_maybe_default(&p.binding);
                        }
                    }
                }
                if let Some(rest) = &obj.rest {
                    self.walk_assignment_target(&rest.target);
                }
            }
            _ => {
                if let Some(member) = target.as_member_expression() {
                    self.walk_member_expression(member);
                }
            }
        }
    }

    fn walk_assignment_target_maybe_default(&mut self, target: &AssignmentTargetMaybeDefault<'_>) {
        match target {
            AssignmentTargetMaybeDefault::AssignmentTargetWithDefault(with_default) => {
                self.walk_assignment_target(&with_default.binding);
                self.walk_expression(&with_default.init);
            }
            _ => {
                if let Some(inner) = target.as_assignment_target() {
                    self.walk_assignment_target(inner);
                }
            }
        }
    }

    // --- Member access ---

    fn walk_member_expression(&mut self, member: &MemberExpression<'_>) {
        match member {
            MemberExpression::StaticMemberExpression(m) => self.walk_static_member(m),
            MemberExpression::ComputedMemberExpression(m) => self.walk_computed_member(m),
            MemberExpression::PrivateFieldExpression(m) => self.walk_expression(&m.object),
        }
    }

    fn walk_static_member(&mut self, member: &StaticMemberExpression<'_>) {
        let prop = member.property.name.as_str();
        if prop == "__proto__" {
            self.escape("Access to '__proto__' is not allowed.", member.span);
        }
        if prop == "constructor" {
            match &member.object {
                Expression::StaticMemberExpression(inner)
                    if inner.property.name.as_str() == "constructor" =>
                {
                    self.escape(
                        "The 'constructor.constructor' chain is not allowed.",
                        member.span,
                    );
                }
                _ => self.escape("Access to 'constructor' is not allowed.", member.span),
            }
        }
        self.record_static_member(member);
        match &member.object {
            // `x.constructor.name` reads a string and never reaches the function.
            Expression::StaticMemberExpression(inner)
                if prop == "name" && inner.property.name.as_str() == "constructor" =>
            {
                self.record_static_member(inner);
                self.walk_expression(&inner.object);
            }
            object => self.walk_expression(object),
        }
    }

    fn record_static_member(&mut self, member: &StaticMemberExpression<'_>) {
        if let Expression::Identifier(obj) = &member.object {
            self.record(Finding::Member {
                object: obj.name.to_string(),
                property: Some(member.property.name.to_string()),
                span: member.span,
            });
        }
    }

    fn walk_computed_member(&mut self, member: &ComputedMemberExpression<'_>) {
        let literal = match &member.expression {
            Expression::StringLiteral(lit) => Some(lit.value.as_str()),
            _ => None,
        };
        match literal {
            Some("constructor") => self.escape(
                "Computed access to 'constructor' is not allowed.",
                member.span,
            ),
            Some("__proto__") => {
                self.escape("Access to '__proto__' is not allowed.", member.span)
            }
            _ => {}
        }
        if let Expression::Identifier(obj) = &member.object {
            self.record(Finding::Member {
                object: obj.name.to_string(),
                property: literal.map(str::to_string),
                span: member.span,
            });
        }
        self.walk_expression(&member.object);
        self.walk_expression(&member.expression);
    }

    fn walk_arguments(&mut self, arguments: &[Argument<'_>]) {
        for arg in arguments {
            match arg {
                Argument::SpreadElement(spread) => self.walk_expression(&spread.argument),
                _ => {
                    if let Some(expr) = arg.as_expression() {
                        self.walk_expression(expr);
                    }
                }
            }
        }
    }

    fn walk_call(&mut self, call: &CallExpression<'_>) {
        if let Expression::Identifier(ident) = &call.callee {
            self.record(Finding::Call {
                callee: ident.name.to_string(),
                span: call.span,
            });
        }
        self.walk_expression(&call.callee);
        self.walk_arguments(&call.arguments);
    }

    // --- Expressions ---

    fn walk_expression(&mut self, expr: &Expression<'_>) {
        match expr {
            Expression::Identifier(ident) => {
                self.record(Finding::Reference {
                    name: ident.name.to_string(),
                    span: ident.span,
                });
            }
            Expression::CallExpression(call) => self.walk_call(call),
            Expression::NewExpression(new_expr) => {
                self.walk_expression(&new_expr.callee);
                self.walk_arguments(&new_expr.arguments);
            }
            Expression::StaticMemberExpression(member) => self.walk_static_member(member),
            Expression::ComputedMemberExpression(member) => self.walk_computed_member(member),
            Expression::PrivateFieldExpression(pfe) => self.walk_expression(&pfe.object),
            Expression::TaggedTemplateExpression(tte) => {
                self.walk_expression(&tte.tag);
                for e in &tte.quasi.expressions {
                    self.walk_expression(e);
                }
            }
            Expression::TemplateLiteral(tl) => {
                for e in &tl.expressions {
                    self.walk_expression(e);
                }
            }
            Expression::MetaProperty(mp) => {
                if mp.meta.name.as_str() == "import" && mp.property.name.as_str() == "meta" {
                    self.escape("'import.meta' is not allowed.", mp.span);
                }
            }
            Expression::ImportExpression(imp) => {
                self.escape("Dynamic import() is not allowed.", imp.span);
                self.walk_expression(&imp.source);
            }
            Expression::ArrowFunctionExpression(arrow) => {
                self.walk_formal_parameters(&arrow.params);
                self.walk_function_body(&arrow.body);
            }
            Expression::FunctionExpression(func) => self.walk_function(func),
            Expression::ClassExpression(class) => self.walk_class(class),
            Expression::AssignmentExpression(assign) => {
                self.walk_assignment_target(&assign.left);
                self.walk_expression(&assign.right);
            }
            Expression::UpdateExpression(update) => match &update.argument {
                SimpleAssignmentTarget::AssignmentTargetIdentifier(ident) => {
                    self.record(Finding::Reference {
                        name: ident.name.to_string(),
                        span: ident.span,
                    });
                }
                other => {
                    if let Some(member) = other.as_member_expression() {
                        self.walk_member_expression(member);
                    }
                }
            },
            Expression::BinaryExpression(bin) => {
                self.walk_expression(&bin.left);
                self.walk_expression(&bin.right);
            }
            Expression::LogicalExpression(logic) => {
                self.walk_expression(&logic.left);
                self.walk_expression(&logic.right);
            }
            Expression::ConditionalExpression(cond) => {
                self.walk_expression(&cond.test);
                self.walk_expression(&cond.consequent);
                self.walk_expression(&cond.alternate);
            }
            Expression::UnaryExpression(unary) => self.walk_expression(&unary.argument),
            Expression::SequenceExpression(seq) => {
                for e in &seq.expressions {
                    self.walk_expression(e);
                }
            }
            Expression::ArrayExpression(arr) => {
                for elem in &arr.elements {
                    match elem {
                        ArrayExpressionElement::SpreadElement(spread) => {
                            self.walk_expression(&spread.argument);
                        }
                        ArrayExpressionElement::Elision(_) => {}
                        _ => {
                            if let Some(e) = elem.as_expression() {
                                self.walk_expression(e);
                            }
                        }
                    }
                }
            }
            Expression::ObjectExpression(obj) => {
                for prop in &obj.properties {
                    match prop {
                        ObjectPropertyKind::ObjectProperty(p) => {
                            if p.computed {
                                if let Some(key) = p.key.as_expression() {
                                    self.walk_expression(key);
                                }
                            }
                            self.walk_expression(&p.value);
                        }
                        ObjectPropertyKind::SpreadProperty(spread) => {
                            self.walk_expression(&spread.argument);
                        }
                    }
                }
            }
            Expression::AwaitExpression(aw) => self.walk_expression(&aw.argument),
            Expression::YieldExpression(y) => {
                if let Some(arg) = &y.argument {
                    self.walk_expression(arg);
                }
            }
            Expression::ParenthesizedExpression(paren) => self.walk_expression(&paren.expression),
            Expression::ChainExpression(chain) => match &chain.expression {
                ChainElement::CallExpression(call) => self.walk_call(call),
                ChainElement::StaticMemberExpression(member) => self.walk_static_member(member),
                ChainElement::ComputedMemberExpression(member) => {
                    self.walk_computed_member(member)
                }
                ChainElement::PrivateFieldExpression(pfe) => self.walk_expression(&pfe.object),
                _ => {}
            },
            // Literals, `this`, `super`, TS and JSX nodes
            _ => {}
        }
    }
}
