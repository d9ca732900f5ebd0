//! Render-context tree.
//!
//! A response body accumulates as a tree whose leaves are literal strings or
//! nested contexts; page code can hand a child context to a helper and keep
//! writing around it, and finalization concatenates everything in tree
//! order into one contiguous string.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

enum Block {
    Text(String),
    Child(Rc<RenderContext>),
}

#[derive(Default)]
pub struct RenderContext {
    disabled: Cell<bool>,
    estimate: Cell<usize>,
    blocks: RefCell<Vec<Block>>,
}

impl RenderContext {
    pub fn new() -> Rc<RenderContext> {
        Rc::new(RenderContext::default())
    }

    /// Stop accepting writes; a disabled context finalizes to whatever it
    /// already holds.
    pub fn disable(&self) {
        self.disabled.set(true);
    }

    pub fn clear(&self) {
        self.disabled.set(false);
        self.estimate.set(0);
        self.blocks.borrow_mut().clear();
    }

    pub fn write(&self, text: impl Into<String>) {
        if self.disabled.get() {
            return;
        }
        let text = text.into();
        self.estimate.set(self.estimate.get() + text.len());
        self.blocks.borrow_mut().push(Block::Text(text));
    }

    /// HTML-escape, then write.
    pub fn write_escaped(&self, text: &str) {
        self.write(escape(text));
    }

    /// Split off a child context at the current position; later writes to
    /// the child land between what came before and what comes after.
    pub fn append_context(self: &Rc<Self>) -> Rc<RenderContext> {
        let child = RenderContext::new();
        if self.disabled.get() {
            child.disable();
        }
        self.blocks.borrow_mut().push(Block::Child(child.clone()));
        child
    }

    /// Concatenate the tree in order. Drains the context.
    pub fn finalize(&self) -> String {
        let blocks = std::mem::take(&mut *self.blocks.borrow_mut());
        let mut output = String::with_capacity(self.estimate.get());
        for block in blocks {
            match block {
                Block::Text(text) => output.push_str(&text),
                Block::Child(child) => output.push_str(&child.finalize()),
            }
        }
        self.estimate.set(0);
        output
    }
}

/// `& < > " '` to their named entities, everything else untouched.
pub fn escape(view: &str) -> String {
    let mut out = String::with_capacity(view.len());
    for c in view.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_concatenate_in_order() {
        let ctx = RenderContext::new();
        ctx.write("a");
        ctx.write("b");
        ctx.write("c");
        assert_eq!(ctx.finalize(), "abc");
    }

    #[test]
    fn child_contexts_keep_their_position() {
        let ctx = RenderContext::new();
        ctx.write("head ");
        let child = ctx.append_context();
        ctx.write(" tail");
        child.write("middle");
        child.write(" parts");
        assert_eq!(ctx.finalize(), "head middle parts tail");
    }

    #[test]
    fn nested_children_flatten_depth_first() {
        let ctx = RenderContext::new();
        let outer = ctx.append_context();
        ctx.write("!");
        let inner = outer.append_context();
        outer.write("b");
        inner.write("a");
        assert_eq!(ctx.finalize(), "ab!");
    }

    #[test]
    fn disabled_contexts_swallow_writes() {
        let ctx = RenderContext::new();
        ctx.write("kept");
        ctx.disable();
        ctx.write("dropped");
        let child = ctx.append_context();
        child.write("also dropped");
        assert_eq!(ctx.finalize(), "kept");
    }

    #[test]
    fn escape_maps_the_five_specials() {
        assert_eq!(
            escape(r#"<a href="x">&'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#39;&lt;/a&gt;"
        );
        assert_eq!(escape("plain text"), "plain text");
    }
}
