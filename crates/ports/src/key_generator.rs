//! 缓存键生成策略
//!
//! 调用点显式构造上下文来生成键，取代运行时解析的表达式

/// 方法调用上下文
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    /// 调用目标（接收者类型或服务名）
    pub target: String,
    /// 方法名
    pub method: String,
    /// 参数的字符串形式
    pub args: Vec<String>,
    /// 调用结果的字符串形式（仅在结果已知时可用）
    pub result: Option<String>,
}

impl InvocationContext {
    pub fn new(target: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method: method.into(),
            ..Default::default()
        }
    }

    /// 追加参数
    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// 设置结果
    pub fn with_result(mut self, result: impl ToString) -> Self {
        self.result = Some(result.to_string());
        self
    }
}

/// 键生成器 trait
pub trait KeyGenerator: Send + Sync {
    fn generate(&self, context: &InvocationContext) -> String;
}

/// 默认键生成器
///
/// 有参数时只用参数拼接（`a:b`），无参数时用 `target.method`
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleKeyGenerator;

impl KeyGenerator for SimpleKeyGenerator {
    fn generate(&self, context: &InvocationContext) -> String {
        if context.args.is_empty() {
            format!("{}.{}", context.target, context.method)
        } else {
            context.args.join(":")
        }
    }
}

/// 基于闭包的键生成器
pub struct FnKeyGenerator<F>(F);

impl<F> FnKeyGenerator<F>
where
    F: Fn(&InvocationContext) -> String + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> KeyGenerator for FnKeyGenerator<F>
where
    F: Fn(&InvocationContext) -> String + Send + Sync,
{
    fn generate(&self, context: &InvocationContext) -> String {
        (self.0)(context)
    }
}
