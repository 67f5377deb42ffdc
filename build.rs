use vergen::EmitBuilder;

fn main() {
    // 生成构建信息，供 /health/status 上报版本与提交号
    // 非 git 环境下输出幂等默认值，不阻断构建
    EmitBuilder::builder()
        .all_build()
        .all_git()
        .emit()
        .expect("生成构建信息失败");
}
