use anyhow::Result;
use textbook_corpus::utils::logging;
use textbook_corpus::{App, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    logging::init();

    // 加载配置
    let config = Config::from_env()?;

    // 初始化并运行应用
    let summary = App::initialize(config).await?.run().await?;

    if summary.succeeded() == 0 {
        anyhow::bail!("没有任何章节生成成功");
    }
    Ok(())
}
